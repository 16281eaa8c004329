//! Per-item predicates applied before items are accumulated

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Called once per item; only items it accepts are kept.
pub type ItemFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

pub fn keep_all() -> ItemFilter {
    Arc::new(|_| true)
}

/// Keeps items whose fields all equal the expected text.
///
/// Strings compare exactly; numbers and booleans compare by their JSON text,
/// so `"12154"` matches both `12154` and `"12154"`. Missing fields, nulls,
/// arrays and objects never match. An empty filter keeps everything.
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    expected: BTreeMap<String, String>,
}

impl FieldFilter {
    pub fn new(expected: BTreeMap<String, String>) -> Self {
        Self { expected }
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn matches(&self, item: &Value) -> bool {
        self.expected.iter().all(|(field, want)| {
            match item.get(field) {
                Some(Value::String(s)) => s == want,
                Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string() == *want,
                _ => false,
            }
        })
    }

    pub fn into_item_filter(self) -> ItemFilter {
        if self.is_empty() {
            return keep_all();
        }
        Arc::new(move |item| self.matches(item))
    }
}
