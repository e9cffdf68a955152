//! Listener registry keyed by canonical address.
//!
//! Iteration is sorted by name, and that order is the ordinal assignment
//! used for fd offsets during handoff. Two processes that register the same
//! set of addresses therefore agree on every offset, whatever order the
//! registrations happened in.

use std::collections::BTreeMap;

use tracing::debug;

use crate::listener::Listener;

/// Sorted map from canonical address to an optional listener.
///
/// A slot without a listener is a reserved ordinal: the address is known
/// but its socket has not been acquired yet.
#[derive(Debug, Default)]
pub struct Container {
    slots: BTreeMap<String, Option<Listener>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `listener` under `name`, reserving the name if it is new.
    ///
    /// # Panics
    ///
    /// Panics if `name` already holds a listener. Two listeners for one
    /// address is a bug in the caller, not a runtime condition.
    pub fn add(&mut self, name: impl Into<String>, listener: Listener) {
        let name = name.into();
        let slot = self.slots.entry(name.clone()).or_insert(None);
        assert!(
            slot.is_none(),
            "Listener '{}' duplicated: each address may hold one listener",
            name
        );
        debug!(name = %name, local = %listener.describe(), "Listener stored");
        *slot = Some(listener);
    }

    /// Reserve the ordinal slot for `name` without a listener. Idempotent.
    pub fn add_null(&mut self, name: impl Into<String>) {
        self.slots.entry(name.into()).or_insert(None);
    }

    /// Position of `name` in sorted order, or `None` if absent.
    pub fn search_index(&self, name: &str) -> Option<usize> {
        self.slots.keys().position(|key| key == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// The listener stored under `name`, if the slot is filled.
    pub fn get(&self, name: &str) -> Option<&Listener> {
        self.slots.get(name).and_then(Option::as_ref)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// All slots in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Listener>)> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.as_str(), slot.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_listener() -> Listener {
        Listener::Tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap())
    }

    #[test]
    fn test_search_index_is_sorted_order() {
        let names = ["tcp@0.0.0.0:8081", "unix@/tmp/a.sock", "tcp@0.0.0.0:8080"];

        // Every insertion order yields the same ordinals.
        for rotation in 0..names.len() {
            let mut container = Container::new();
            for i in 0..names.len() {
                container.add_null(names[(i + rotation) % names.len()]);
            }
            assert_eq!(container.search_index("tcp@0.0.0.0:8080"), Some(0));
            assert_eq!(container.search_index("tcp@0.0.0.0:8081"), Some(1));
            assert_eq!(container.search_index("unix@/tmp/a.sock"), Some(2));
        }
    }

    #[test]
    fn test_search_index_absent() {
        let mut container = Container::new();
        assert_eq!(container.search_index("tcp@0.0.0.0:8080"), None);

        container.add_null("tcp@0.0.0.0:8080");
        assert_eq!(container.search_index("tcp@0.0.0.0:9090"), None);
    }

    #[test]
    fn test_add_null_is_idempotent() {
        let mut container = Container::new();
        container.add_null("tcp@0.0.0.0:8080");
        container.add_null("tcp@0.0.0.0:8080");
        assert_eq!(container.len(), 1);
        assert!(container.get("tcp@0.0.0.0:8080").is_none());
    }

    #[test]
    fn test_add_fills_reserved_slot() {
        let mut container = Container::new();
        container.add_null("tcp@0.0.0.0:8080");
        container.add("tcp@0.0.0.0:8080", tcp_listener());

        assert_eq!(container.len(), 1);
        assert!(container.get("tcp@0.0.0.0:8080").is_some());
        assert_eq!(container.names().collect::<Vec<_>>(), vec!["tcp@0.0.0.0:8080"]);
    }

    #[test]
    fn test_add_new_name_reserves_it() {
        let mut container = Container::new();
        container.add("unix@/tmp/x.sock", tcp_listener());
        assert!(container.contains("unix@/tmp/x.sock"));
        assert_eq!(container.search_index("unix@/tmp/x.sock"), Some(0));
    }

    #[test]
    #[should_panic(expected = "Listener 'tcp@0.0.0.0:8080' duplicated")]
    fn test_add_duplicate_panics() {
        let mut container = Container::new();
        container.add("tcp@0.0.0.0:8080", tcp_listener());
        container.add("tcp@0.0.0.0:8080", tcp_listener());
    }

    #[test]
    fn test_iter_reports_empty_slots() {
        let mut container = Container::new();
        container.add_null("b");
        container.add("a", tcp_listener());

        let slots: Vec<_> = container
            .iter()
            .map(|(name, slot)| (name.to_string(), slot.is_some()))
            .collect();
        assert_eq!(slots, vec![("a".to_string(), true), ("b".to_string(), false)]);
    }
}
