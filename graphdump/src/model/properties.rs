use crate::model::InputGraph;
use crate::pool::{NameLength, PoolObject};

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A decoded property value.
///
/// Nested subgraphs are first-class values so that builders can route a
/// recursively parsed graph into the property slot it belongs to.
#[derive(Clone, Debug)]
pub enum PropertyValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(Arc<str>),
    Object(PoolObject),
    Graph(Arc<InputGraph>),
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        use PropertyValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            // Subgraph values compare by identity; graphs are never
            // structurally deduplicated at the property level.
            (Graph(a), Graph(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PropertyValue {
    /// Textual form honouring a length modifier where the value supports
    /// one (methods do, everything else ignores it).
    pub fn text_with_length(&self, length: NameLength) -> String {
        match self {
            PropertyValue::Object(PoolObject::Method(m)) => m.display_name(length),
            other => other.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Long(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Double(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::Object(o) => write!(f, "{o}"),
            PropertyValue::Graph(g) => f.write_str(&g.name),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(Arc::from(s))
    }
}

/// Insertion-ordered key/value bundle attached to documents, groups,
/// graphs, nodes and edges.  Key sets are small; linear scans beat hashing
/// here and keep iteration order stable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    entries: Vec<(Arc<str>, PropertyValue)>,
}

impl Properties {
    pub fn new() -> Properties {
        Properties::default()
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    /// Sets `key`, overwriting an existing entry of the same name.
    pub fn set(&mut self, key: Arc<str>, value: PropertyValue) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Deduplicating store for strings that recur across a dump, such as
/// property keys and pool strings.
#[derive(Debug, Default)]
pub struct Interner {
    set: HashSet<Arc<str>>,
}

impl Interner {
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.set.get(s) {
            return existing.clone();
        }
        let shared: Arc<str> = Arc::from(s);
        self.set.insert(shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Process-wide interner, enabled by setting `GRAPHDUMP_INTERN` in the
/// environment.  The toggle is read once and frozen; whether it is on or
/// off must never change observable property values, only string sharing.
static GLOBAL_INTERNER: Lazy<Option<Mutex<Interner>>> = Lazy::new(|| {
    let enabled = std::env::var("GRAPHDUMP_INTERN")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);
    enabled.then(|| Mutex::new(Interner::default()))
});

/// Shared string for a property key or value, coalesced through the global
/// interner when the toggle is on.
pub fn intern(s: &str) -> Arc<str> {
    match GLOBAL_INTERNER.as_ref() {
        Some(interner) => interner.lock().expect("interner poisoned").intern(s),
        None => Arc::from(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_keeps_order() {
        let mut props = Properties::new();
        props.set(Arc::from("a"), PropertyValue::Int(1));
        props.set(Arc::from("b"), PropertyValue::Int(2));
        props.set(Arc::from("a"), PropertyValue::Int(3));
        let keys: Vec<&str> = props.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(props.get("a"), Some(&PropertyValue::Int(3)));
    }

    #[test]
    fn interner_coalesces_identical_strings() {
        let mut interner = Interner::default();
        let a = interner.intern("node");
        let b = interner.intern("node");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn display_forms() {
        assert_eq!(PropertyValue::Int(-3).to_string(), "-3");
        assert_eq!(PropertyValue::Bool(true).to_string(), "true");
        assert_eq!(PropertyValue::from("x").to_string(), "x");
        assert_eq!(PropertyValue::Double(0.5).to_string(), "0.5");
    }
}
