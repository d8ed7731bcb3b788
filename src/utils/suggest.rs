fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let m = b.len();
    if a.is_empty() {
        return m;
    }
    if m == 0 {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0; m + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        prev.clone_from_slice(&curr);
    }
    prev[m]
}

fn score(input: &str, candidate: &str) -> usize {
    let a = normalize_token(input);
    let b = normalize_token(candidate);
    if a.is_empty() || b.is_empty() {
        return usize::MAX;
    }
    if a == b {
        return 0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 1;
    }
    levenshtein(&a, &b)
}

fn max_allowed_distance(input: &str) -> usize {
    match normalize_token(input).len() {
        0 => 0,
        1..=4 => 1,
        5..=8 => 2,
        n => (n as f32 * 0.35).floor().max(3.0) as usize,
    }
}

/// Near-miss suggestions for an unrecognized action or field name, closest
/// first. Ties break toward shorter, then lexicographically smaller names.
pub fn suggest(input: &str, candidates: &[String], limit: usize) -> Vec<String> {
    if input.trim().is_empty() || candidates.is_empty() {
        return Vec::new();
    }
    let limit = limit.max(1);
    let allowed = max_allowed_distance(input);

    let mut scored: Vec<(&String, usize)> = candidates
        .iter()
        .map(|candidate| (candidate, score(input, candidate)))
        .filter(|(_, s)| *s <= allowed)
        .collect();
    scored.sort_by(|a, b| {
        a.1.cmp(&b.1)
            .then_with(|| a.0.len().cmp(&b.0.len()))
            .then_with(|| a.0.cmp(b.0))
    });

    let mut out: Vec<String> = Vec::new();
    for (candidate, _) in scored {
        if !out.contains(candidate) {
            out.push(candidate.clone());
        }
        if out.len() >= limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match_ranks_first() {
        let candidates = names(&["find_fields", "field_info", "list_databases"]);
        let got = suggest("find_fields", &candidates, 3);
        assert_eq!(got.first().map(|s| s.as_str()), Some("find_fields"));
    }

    #[test]
    fn close_typo_is_suggested() {
        let candidates = names(&["find_fields", "field_info", "list_systems"]);
        let got = suggest("find_feilds", &candidates, 3);
        assert!(got.contains(&"find_fields".to_string()));
    }

    #[test]
    fn distant_input_yields_nothing() {
        let candidates = names(&["list_systems"]);
        assert!(suggest("zzzz", &candidates, 3).is_empty());
    }
}
