use crate::constants::{discovery, markers};
use crate::errors::ToolError;
use crate::services::cache::{make_cache_key, TtlCache};
use crate::services::client::EmsClient;
use crate::services::logger::Logger;
use crate::services::reference_store::{ReferenceKind, ReferenceStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

// Bracket-encoded analytic IDs start with the hub prefix or carry two
// adjacent bracket groups. Everything else is treated as a human-readable
// name.
static BRACKET_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"^{}|^\[.+?\]\[.+?\]",
        regex::escape(markers::HUB_ID_PREFIX)
    );
    Regex::new(&pattern).expect("bracket ID pattern")
});

/// Entity-type databases reject the flat field search endpoint; their fields
/// must be discovered by walking field groups. `[entity-type-group]` marks a
/// navigation node, not a queryable database, and takes precedence.
pub fn is_entity_type_database(database_id: &str) -> bool {
    database_id.contains(markers::ENTITY_TYPE)
        && !database_id.contains(markers::ENTITY_TYPE_GROUP)
}

/// True when the value already looks like a raw analytic ID (compressed or
/// bracket-encoded) rather than a name to resolve.
pub fn is_analytic_id(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    value.starts_with(markers::COMPRESSED_ID_PREFIX) || BRACKET_ID_PATTERN.is_match(value)
}

/// What a caller supplied as a field reference: a numbered reference from a
/// previous discovery result, or text (an opaque ID or a name).
#[derive(Debug, Clone)]
pub enum FieldRef {
    Number(u64),
    Text(String),
}

impl FieldRef {
    /// Accepts a JSON integer, a digit-only string, or any other string.
    pub fn from_value(value: &Value) -> Result<Self, ToolError> {
        if let Some(number) = value.as_u64() {
            return Ok(FieldRef::Number(number));
        }
        if let Some(text) = value.as_str() {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(ToolError::resolution("Invalid field reference: empty string")
                    .with_hint("Pass a [N] reference number, a field name, or an opaque ID."));
            }
            if trimmed.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(number) = trimmed.parse::<u64>() {
                    return Ok(FieldRef::Number(number));
                }
            }
            return Ok(FieldRef::Text(trimmed.to_string()));
        }
        Err(ToolError::resolution(format!(
            "Invalid field reference: {}",
            value
        )))
    }
}

/// A field surfaced by the BFS traversal.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    pub name: String,
    pub id: String,
    pub field_type: String,
    pub units: Option<String>,
    pub path: String,
}

/// Bounds for one BFS traversal. Values outside the hard caps are clamped,
/// never rejected.
#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_depth: usize,
    pub max_results: usize,
    pub max_groups: usize,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: discovery::DEFAULT_MAX_DEPTH,
            max_results: discovery::DEFAULT_MAX_RESULTS,
            max_groups: discovery::DEFAULT_MAX_GROUPS,
        }
    }
}

impl TraversalLimits {
    pub fn clamped(self) -> Self {
        Self {
            max_depth: self.max_depth.clamp(1, discovery::MAX_DEPTH_CAP),
            max_results: self.max_results.clamp(1, discovery::MAX_RESULTS_CAP),
            max_groups: self.max_groups.clamp(1, discovery::MAX_GROUPS_CAP),
        }
    }
}

/// Resolves whatever a caller supplies (a numbered reference, an opaque
/// bracket-encoded ID, or a human-readable name) into the canonical opaque
/// identifier the EMS query and metadata endpoints require.
///
/// Resolution failures are terminal: ambiguity and not-found reflect the
/// backend's current state, not transient faults, so they are never retried.
pub struct Resolver {
    logger: Logger,
    client: Arc<EmsClient>,
    field_cache: Arc<TtlCache<Value>>,
    database_cache: Arc<TtlCache<Value>>,
    refs: Arc<ReferenceStore>,
}

impl Resolver {
    pub fn new(
        logger: Logger,
        client: Arc<EmsClient>,
        field_cache: Arc<TtlCache<Value>>,
        database_cache: Arc<TtlCache<Value>>,
        refs: Arc<ReferenceStore>,
    ) -> Self {
        Self {
            logger: logger.child("resolver"),
            client,
            field_cache,
            database_cache,
            refs,
        }
    }

    pub fn reference_store(&self) -> &Arc<ReferenceStore> {
        &self.refs
    }

    /// Resolve a database name to an opaque database ID. Bracket-encoded
    /// input passes through unchanged. The first lookup per system builds a
    /// name map from the root database groups plus exactly one level of
    /// subgroups and caches it.
    pub async fn resolve_database(
        &self,
        database_ref: &str,
        system_id: i64,
    ) -> Result<String, ToolError> {
        let database_ref = database_ref.trim();
        if database_ref.is_empty() {
            return Err(ToolError::resolution("database_id cannot be empty")
                .with_hint("Pass a database name (e.g. \"FDW Flights\") or an opaque ID."));
        }
        if database_ref.starts_with('[') {
            return Ok(database_ref.to_string());
        }

        let cache_key = make_cache_key(&["database_name_map", &system_id.to_string()]);
        let name_map = match self.database_cache.get(&cache_key) {
            Some(map) => map,
            None => {
                let map = self.build_database_name_map(system_id).await?;
                self.database_cache.set(&cache_key, map.clone());
                map
            }
        };

        let lookup = database_ref.to_lowercase();
        if let Some(id) = name_map.get(&lookup).and_then(|v| v.as_str()) {
            return Ok(id.to_string());
        }

        let mut known: Vec<&str> = name_map
            .as_object()
            .map(|map| map.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        known.sort_unstable();
        let shown: Vec<&str> = known
            .iter()
            .copied()
            .take(discovery::SAMPLE_NAME_LIMIT)
            .collect();
        let suffix = if known.len() > shown.len() { ", ..." } else { "" };
        Err(ToolError::resolution(format!(
            "Database not found: '{}'. Available databases include: {}{}",
            database_ref,
            shown.join(", "),
            suffix
        ))
        .with_hint("Use list_databases to browse available databases."))
    }

    async fn build_database_name_map(&self, system_id: i64) -> Result<Value, ToolError> {
        let root = self
            .client
            .get(&format!("/api/v2/ems-systems/{}/database-groups", system_id))
            .await
            .map_err(|err| err.wrap("failed to fetch database groups"))?;

        let mut name_map = serde_json::Map::new();
        index_databases(&root, &mut name_map);

        // One level of subgroups, bounded fan-out. A failing subgroup fetch
        // is skipped rather than aborting the whole map.
        for group in root
            .get("groups")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let Some(group_id) = group.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            match self
                .client
                .get_query(
                    &format!("/api/v2/ems-systems/{}/database-groups", system_id),
                    &[("groupId", group_id.to_string())],
                )
                .await
            {
                Ok(sub) => index_databases(&sub, &mut name_map),
                Err(err) => {
                    self.logger.warn(
                        "Skipping database subgroup",
                        Some(&serde_json::json!({ "group_id": group_id, "error": err.message })),
                    );
                }
            }
        }

        Ok(Value::Object(name_map))
    }

    /// Resolve a field reference to an opaque field ID.
    ///
    /// Resolution order: numbered reference -> store lookup (a reference of
    /// kind analytic is a distinct wrong-kind error, never an ID);
    /// bracket-encoded -> pass through; anything else -> name search with
    /// exact-match / single-result / ambiguous disambiguation.
    pub async fn resolve_field(
        &self,
        field_ref: &FieldRef,
        system_id: i64,
        database_id: &str,
    ) -> Result<String, ToolError> {
        let name = match field_ref {
            FieldRef::Number(reference) => {
                let entry = self.refs.lookup(*reference).ok_or_else(|| {
                    ToolError::resolution(format!(
                        "Reference [{}] not found in result store.",
                        reference
                    ))
                    .with_hint("Re-run find_fields to get fresh references.")
                })?;
                if entry.kind == ReferenceKind::Analytic {
                    return Err(ToolError::resolution(format!(
                        "Reference [{}] ('{}') is an analytic parameter, not a database field.",
                        reference, entry.name
                    ))
                    .with_code("WRONG_KIND")
                    .with_hint(
                        "Use it with the analytics query, or use find_fields to find \
                         database field references.",
                    ));
                }
                return Ok(entry.id);
            }
            FieldRef::Text(text) => text.trim().to_string(),
        };

        if name.starts_with('[') {
            return Ok(name);
        }

        let cache_key = make_cache_key(&[
            "field_resolve",
            &system_id.to_string(),
            database_id,
            &name.to_lowercase(),
        ]);
        if let Some(cached) = self.field_cache.get(&cache_key) {
            if let Some(id) = cached.as_str() {
                return Ok(id.to_string());
            }
        }

        // Entity-type databases reject the flat search endpoint (405); walk
        // the field-group hierarchy instead.
        let candidates = if is_entity_type_database(database_id) {
            let limits = TraversalLimits {
                max_depth: discovery::MAX_DEPTH_CAP,
                ..TraversalLimits::default()
            };
            let (matches, _) = self
                .search_fields_deep(system_id, database_id, &name, limits)
                .await?;
            matches
                .into_iter()
                .map(|m| (m.name, m.id))
                .collect::<Vec<_>>()
        } else {
            let results = self
                .client
                .get_query(
                    &format!(
                        "/api/v2/ems-systems/{}/databases/{}/fields",
                        system_id, database_id
                    ),
                    &[("text", name.clone())],
                )
                .await?;
            collect_named_ids(&results)
        };

        let (_, id) = disambiguate(&candidates, &name, "field", "find_fields")?;
        self.field_cache.set(&cache_key, Value::String(id.clone()));
        Ok(id)
    }

    /// Resolve analytic names or raw IDs to (display name, opaque ID) pairs,
    /// order-preserving. Raw IDs pass through untouched.
    pub async fn resolve_analytics(
        &self,
        names_or_ids: &[String],
        system_id: i64,
    ) -> Result<Vec<(String, String)>, ToolError> {
        let mut resolved = Vec::with_capacity(names_or_ids.len());

        for item in names_or_ids {
            let item = item.trim();
            if is_analytic_id(item) {
                resolved.push((item.to_string(), item.to_string()));
                continue;
            }

            let cache_key = make_cache_key(&[
                "analytic_resolve",
                &system_id.to_string(),
                &item.to_lowercase(),
            ]);
            if let Some(cached) = self.field_cache.get(&cache_key) {
                if let (Some(name), Some(id)) = (
                    cached.get(0).and_then(|v| v.as_str()),
                    cached.get(1).and_then(|v| v.as_str()),
                ) {
                    resolved.push((name.to_string(), id.to_string()));
                    continue;
                }
            }

            let results = self
                .client
                .get_query(
                    &format!("/api/v2/ems-systems/{}/analytics", system_id),
                    &[("text", item.to_string())],
                )
                .await?;
            let candidates = collect_named_ids(&results);
            let (name, id) = disambiguate(&candidates, item, "analytic", "search_analytics")?;
            self.field_cache.set(
                &cache_key,
                serde_json::json!([name.clone(), id.clone()]),
            );
            resolved.push((name, id));
        }

        Ok(resolved)
    }

    /// Fetch one field group, cached per (system, database, group). The same
    /// key is used by browse mode so entries are shared between code paths.
    pub async fn fetch_field_group(
        &self,
        system_id: i64,
        database_id: &str,
        group_id: Option<&str>,
    ) -> Result<Value, ToolError> {
        let cache_key = make_cache_key(&[
            "field_group",
            &system_id.to_string(),
            database_id,
            group_id.unwrap_or("root"),
        ]);
        if let Some(cached) = self.field_cache.get(&cache_key) {
            return Ok(cached);
        }

        let path = format!(
            "/api/v2/ems-systems/{}/databases/{}/field-groups",
            system_id, database_id
        );
        let group = match group_id {
            Some(group_id) => {
                self.client
                    .get_query(&path, &[("groupId", group_id.to_string())])
                    .await?
            }
            None => self.client.get(&path).await?,
        };
        self.field_cache.set(&cache_key, group.clone());
        Ok(group)
    }

    /// Fetch one field's raw metadata, cached per (system, database, field).
    /// The field_info action and discrete filter-value resolution share the
    /// same key, so either path warms the cache for the other.
    pub async fn field_metadata(
        &self,
        system_id: i64,
        database_id: &str,
        field_id: &str,
    ) -> Result<Value, ToolError> {
        let cache_key = make_cache_key(&[
            "field_info",
            &system_id.to_string(),
            database_id,
            field_id,
        ]);
        if let Some(cached) = self.field_cache.get(&cache_key) {
            return Ok(cached);
        }
        let path = format!(
            "/api/v2/ems-systems/{}/databases/{}/fields/{}",
            system_id,
            database_id,
            encode_path_segment(field_id)
        );
        let field = self.client.get(&path).await?;
        self.field_cache.set(&cache_key, field.clone());
        Ok(field)
    }

    /// Breadth-first traversal of the field-group hierarchy looking for
    /// fields whose name contains `search_text` (case-insensitive).
    ///
    /// Each visited group costs one backend call (cached). The traversal
    /// stops once enough matches accumulate, the call budget is spent, or
    /// only entries past the depth bound remain. Subgroups sharing a word
    /// with the search text are visited first so likely matches surface
    /// before the budget runs out. A group fetch that fails is counted as
    /// visited and skipped.
    ///
    /// Returns the matches and the number of groups visited.
    pub async fn search_fields_deep(
        &self,
        system_id: i64,
        database_id: &str,
        search_text: &str,
        limits: TraversalLimits,
    ) -> Result<(Vec<FieldMatch>, usize), ToolError> {
        let limits = limits.clamped();
        let search_lower = search_text.to_lowercase();
        let search_words: HashSet<&str> = search_lower.split_whitespace().collect();

        let mut matches: Vec<FieldMatch> = Vec::new();
        let mut groups_visited = 0usize;

        let mut queue: VecDeque<(Option<String>, usize, Vec<String>)> = VecDeque::new();
        queue.push_back((None, 0, Vec::new()));

        while let Some((group_id, depth, path_parts)) = {
            if matches.len() >= limits.max_results || groups_visited >= limits.max_groups {
                None
            } else {
                queue.pop_front()
            }
        } {
            if depth > limits.max_depth {
                continue;
            }

            let group = match self
                .fetch_field_group(system_id, database_id, group_id.as_deref())
                .await
            {
                Ok(group) => {
                    groups_visited += 1;
                    group
                }
                Err(err) => {
                    groups_visited += 1;
                    self.logger.warn(
                        "Skipping field group",
                        Some(&serde_json::json!({
                            "group_id": group_id,
                            "error": err.message,
                        })),
                    );
                    continue;
                }
            };

            let group_name = group.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let mut current_path = path_parts;
            if !group_name.is_empty() && depth > 0 {
                current_path.push(group_name.to_string());
            }

            for field in group
                .get("fields")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                if matches.len() >= limits.max_results {
                    break;
                }
                let field_name = field.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if field_name.to_lowercase().contains(&search_lower) {
                    matches.push(FieldMatch {
                        name: field_name.to_string(),
                        id: field
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        field_type: field
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        units: field
                            .get("units")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        path: if current_path.is_empty() {
                            "(root)".to_string()
                        } else {
                            current_path.join(" > ")
                        },
                    });
                }
            }

            if depth < limits.max_depth {
                for sub in group
                    .get("groups")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                {
                    let Some(sub_id) = sub.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let sub_name_lower = sub
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_lowercase();
                    let entry = (Some(sub_id.to_string()), depth + 1, current_path.clone());
                    let relevant = sub_name_lower
                        .split_whitespace()
                        .any(|word| search_words.contains(word));
                    if relevant {
                        queue.push_front(entry);
                    } else {
                        queue.push_back(entry);
                    }
                }
            }
        }

        Ok((matches, groups_visited))
    }
}

/// Percent-encode one path segment, RFC 3986 unreserved characters excepted.
pub fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Index every database in a group response under all of its name fields.
fn index_databases(group: &Value, name_map: &mut serde_json::Map<String, Value>) {
    for db in group
        .get("databases")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let id = db.get("id").and_then(|v| v.as_str()).unwrap_or("");
        for name_key in ["name", "pluralName", "singularName"] {
            if let Some(name) = db.get(name_key).and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    name_map.insert(name.to_lowercase(), Value::String(id.to_string()));
                }
            }
        }
    }
}

/// Extract (name, id) pairs from a JSON array of search results.
fn collect_named_ids(results: &Value) -> Vec<(String, String)> {
    results
        .as_array()
        .into_iter()
        .flatten()
        .map(|item| {
            (
                item.get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string(),
                item.get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            )
        })
        .collect()
}

/// Shared disambiguation: a unique case-insensitive exact name match wins;
/// otherwise a single result is unambiguous; otherwise the name is ambiguous
/// or unknown.
fn disambiguate(
    candidates: &[(String, String)],
    query: &str,
    kind_label: &str,
    discovery_tool: &str,
) -> Result<(String, String), ToolError> {
    if candidates.is_empty() {
        return Err(ToolError::resolution(format!(
            "{} not found: '{}'",
            capitalize(kind_label),
            query
        ))
        .with_hint(format!(
            "Use {} to discover valid {} names.",
            discovery_tool, kind_label
        )));
    }

    let query_lower = query.to_lowercase();
    let exact: Vec<&(String, String)> = candidates
        .iter()
        .filter(|(name, _)| name.to_lowercase() == query_lower)
        .collect();
    if exact.len() == 1 {
        return Ok(exact[0].clone());
    }
    if candidates.len() == 1 {
        return Ok(candidates[0].clone());
    }

    let shown: Vec<&str> = candidates
        .iter()
        .take(discovery::AMBIGUOUS_NAME_LIMIT)
        .map(|(name, _)| name.as_str())
        .collect();
    let suffix = if candidates.len() > shown.len() {
        "..."
    } else {
        ""
    };
    Err(ToolError::resolution(format!(
        "Ambiguous {} name: '{}'. Multiple matches found: {}{}",
        kind_label,
        query,
        shown.join(", "),
        suffix
    ))
    .with_hint(format!(
        "Use a more specific name or use {} to find the exact name.",
        discovery_tool
    )))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;

    #[test]
    fn entity_type_detection_requires_bare_marker() {
        assert!(is_entity_type_database("[x][entity-type][y]"));
        assert!(!is_entity_type_database("[x][entity-type-group][y]"));
        // The group marker takes precedence when both are present.
        assert!(!is_entity_type_database("[x][entity-type-group][entity-type][y]"));
        assert!(!is_entity_type_database("[ems-core][stuff]"));
    }

    #[test]
    fn analytic_id_sniffing() {
        assert!(is_analytic_id("H4sIAAAAAAAEAO29B2AcSZYlJi9tynt"));
        assert!(is_analytic_id("[-hub-][field][[ems-core]]"));
        assert!(is_analytic_id("[a][b] trailing text"));
        assert!(!is_analytic_id("Pressure Altitude"));
        assert!(!is_analytic_id("[single-bracket-group]"));
        assert!(!is_analytic_id(""));
        assert!(!is_analytic_id("   "));
    }

    #[test]
    fn path_segment_encoding_covers_reserved_characters() {
        assert_eq!(encode_path_segment("plain-id_0.9~x"), "plain-id_0.9~x");
        assert_eq!(
            encode_path_segment("[field][alt baro]"),
            "%5Bfield%5D%5Balt%20baro%5D"
        );
        assert_eq!(encode_path_segment("a/b+c"), "a%2Fb%2Bc");
    }

    #[test]
    fn field_ref_classification() {
        assert!(matches!(
            FieldRef::from_value(&serde_json::json!(42)),
            Ok(FieldRef::Number(42))
        ));
        assert!(matches!(
            FieldRef::from_value(&serde_json::json!("17")),
            Ok(FieldRef::Number(17))
        ));
        assert!(matches!(
            FieldRef::from_value(&serde_json::json!("Altitude")),
            Ok(FieldRef::Text(_))
        ));
        assert!(FieldRef::from_value(&serde_json::json!("  ")).is_err());
        assert!(FieldRef::from_value(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn traversal_limits_are_clamped_not_rejected() {
        let limits = TraversalLimits {
            max_depth: 99,
            max_results: 0,
            max_groups: 10_000,
        }
        .clamped();
        assert_eq!(limits.max_depth, 10);
        assert_eq!(limits.max_results, 1);
        assert_eq!(limits.max_groups, 200);
    }

    #[test]
    fn disambiguate_prefers_unique_exact_match() {
        let candidates = vec![
            ("Altitude".to_string(), "[alt]".to_string()),
            ("Altitude (GPS)".to_string(), "[alt-gps]".to_string()),
        ];
        let (name, id) = disambiguate(&candidates, "altitude", "field", "find_fields").unwrap();
        assert_eq!(name, "Altitude");
        assert_eq!(id, "[alt]");
    }

    #[test]
    fn disambiguate_accepts_single_inexact_result() {
        let candidates = vec![("Altitude (Baro)".to_string(), "[alt-baro]".to_string())];
        let (_, id) = disambiguate(&candidates, "altitude", "field", "find_fields").unwrap();
        assert_eq!(id, "[alt-baro]");
    }

    #[test]
    fn disambiguate_rejects_multiple_inexact_results() {
        let candidates = vec![
            ("Altitude (Baro)".to_string(), "[alt-baro]".to_string()),
            ("Altitude (GPS)".to_string(), "[alt-gps]".to_string()),
        ];
        let err = disambiguate(&candidates, "Altitude", "field", "find_fields").unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Resolution);
        assert!(err.message.contains("Ambiguous"));
        assert!(err.message.contains("Altitude (Baro)"));
        assert!(err.message.contains("Altitude (GPS)"));
    }

    #[test]
    fn disambiguate_reports_not_found() {
        let err = disambiguate(&[], "fuel", "analytic", "search_analytics").unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Resolution);
        assert!(err.message.contains("Analytic not found"));
    }
}
