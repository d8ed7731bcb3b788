use crate::constants::discovery;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Field,
    Analytic,
}

impl ReferenceKind {
    pub fn label(self) -> &'static str {
        match self {
            ReferenceKind::Field => "field",
            ReferenceKind::Analytic => "analytic",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReference {
    pub name: String,
    pub id: String,
    pub kind: ReferenceKind,
}

struct Inner {
    entries: BTreeMap<u64, StoredReference>,
    next_ref: u64,
}

/// Maps small integers to (name, opaque ID, kind) tuples surfaced during
/// discovery, so an agent can say `[12]` instead of re-transmitting a long
/// opaque ID. Shared across all tool calls in the process; sequence numbers
/// are never reused. Oldest entries are evicted once capacity is exceeded.
pub struct ReferenceStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::with_capacity(discovery::STORE_MAX_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_ref: 0,
            }),
        }
    }

    /// Store a surfaced result and return its reference number.
    pub fn store(&self, name: &str, id: &str, kind: ReferenceKind) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let reference = inner.next_ref;
        inner.next_ref += 1;
        inner.entries.insert(
            reference,
            StoredReference {
                name: name.to_string(),
                id: id.to_string(),
                kind,
            },
        );
        while inner.entries.len() > self.capacity {
            // BTreeMap keys are ordered, so the first key is the oldest.
            match inner.entries.keys().next().copied() {
                Some(oldest) => inner.entries.remove(&oldest),
                None => break,
            };
        }
        reference
    }

    pub fn lookup(&self, reference: u64) -> Option<StoredReference> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&reference).cloned()
    }

    /// Test hook: drop all entries and restart numbering.
    #[doc(hidden)]
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.next_ref = 0;
    }
}

impl Default for ReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}
