//! Operator allow and block lists
//!
//! Entries optionally expire; an expired entry behaves as if absent and is
//! purged lazily on the next read of its list.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What kind of value a list entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Ip,
    Domain,
    Package,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub value: String,
    pub entry_type: EntryType,
    /// Millisecond epoch
    pub added_at: i64,
    /// Millisecond epoch; `None` means permanent
    pub expires_at: Option<i64>,
    pub reason: Option<String>,
}

impl ListEntry {
    pub fn new(value: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            value: value.into(),
            entry_type,
            added_at: Utc::now().timestamp_millis(),
            expires_at: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Allow and block lists behind one store
#[derive(Default)]
pub struct ListStore {
    allow: RwLock<Vec<ListEntry>>,
    block: RwLock<Vec<ListEntry>>,
}

impl ListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_allowlist(&self, entry: ListEntry) {
        Self::upsert(&self.allow, entry);
    }

    pub fn add_to_blocklist(&self, entry: ListEntry) {
        Self::upsert(&self.block, entry);
    }

    pub fn remove_from_allowlist(&self, value: &str, entry_type: EntryType) {
        self.allow
            .write()
            .retain(|e| !(e.value == value && e.entry_type == entry_type));
    }

    pub fn remove_from_blocklist(&self, value: &str, entry_type: EntryType) {
        self.block
            .write()
            .retain(|e| !(e.value == value && e.entry_type == entry_type));
    }

    pub fn is_allowed(&self, value: &str, entry_type: EntryType) -> bool {
        Self::contains(&self.allow, value, entry_type)
    }

    pub fn is_blocked(&self, value: &str, entry_type: EntryType) -> bool {
        Self::contains(&self.block, value, entry_type)
    }

    pub fn allowlist(&self) -> Vec<ListEntry> {
        Self::valid_entries(&self.allow)
    }

    pub fn blocklist(&self) -> Vec<ListEntry> {
        Self::valid_entries(&self.block)
    }

    /// Merge entries into the blocklist, replacing same value+type pairs
    pub fn import_blocklist(&self, entries: Vec<ListEntry>) {
        let mut list = self.block.write();
        for new in entries {
            list.retain(|e| !(e.value == new.value && e.entry_type == new.entry_type));
            list.push(new);
        }
    }

    pub fn export_blocklist(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.blocklist())
    }

    pub fn clear_blocklist(&self) {
        self.block.write().clear();
    }

    pub fn clear_allowlist(&self) {
        self.allow.write().clear();
    }

    fn upsert(list: &RwLock<Vec<ListEntry>>, entry: ListEntry) {
        let mut list = list.write();
        list.retain(|e| !(e.value == entry.value && e.entry_type == entry.entry_type));
        list.push(entry);
    }

    fn contains(list: &RwLock<Vec<ListEntry>>, value: &str, entry_type: EntryType) -> bool {
        let now = Utc::now().timestamp_millis();
        {
            let read = list.read();
            if !read.iter().any(|e| e.is_expired(now)) {
                return read
                    .iter()
                    .any(|e| e.value == value && e.entry_type == entry_type);
            }
        }
        // lazy purge, then answer from the cleaned list
        let mut write = list.write();
        write.retain(|e| !e.is_expired(now));
        write
            .iter()
            .any(|e| e.value == value && e.entry_type == entry_type)
    }

    fn valid_entries(list: &RwLock<Vec<ListEntry>>) -> Vec<ListEntry> {
        let now = Utc::now().timestamp_millis();
        list.read()
            .iter()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_allow() {
        let store = ListStore::new();
        store.add_to_blocklist(ListEntry::new("203.0.113.9", EntryType::Ip).with_reason("C2"));
        store.add_to_allowlist(ListEntry::new("updates.example.com", EntryType::Domain));

        assert!(store.is_blocked("203.0.113.9", EntryType::Ip));
        assert!(!store.is_blocked("203.0.113.9", EntryType::Domain));
        assert!(store.is_allowed("updates.example.com", EntryType::Domain));
    }

    #[test]
    fn test_expired_entry_absent() {
        let store = ListStore::new();
        let past = Utc::now().timestamp_millis() - 1_000;
        store.add_to_blocklist(ListEntry::new("198.51.100.7", EntryType::Ip).with_expiry(past));

        assert!(!store.is_blocked("198.51.100.7", EntryType::Ip));
        // and it was purged
        assert!(store.blocklist().is_empty());
    }

    #[test]
    fn test_upsert_replaces() {
        let store = ListStore::new();
        store.add_to_blocklist(ListEntry::new("evil.example", EntryType::Domain).with_reason("a"));
        store.add_to_blocklist(ListEntry::new("evil.example", EntryType::Domain).with_reason("b"));

        let list = store.blocklist();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason.as_deref(), Some("b"));
    }

    #[test]
    fn test_export_import_roundtrip() {
        let store = ListStore::new();
        store.add_to_blocklist(ListEntry::new("203.0.113.9", EntryType::Ip));
        let json = store.export_blocklist().unwrap();

        let other = ListStore::new();
        let entries: Vec<ListEntry> = serde_json::from_str(&json).unwrap();
        other.import_blocklist(entries);
        assert!(other.is_blocked("203.0.113.9", EntryType::Ip));
    }

    #[test]
    fn test_remove() {
        let store = ListStore::new();
        store.add_to_blocklist(ListEntry::new("203.0.113.9", EntryType::Ip));
        store.remove_from_blocklist("203.0.113.9", EntryType::Ip);
        assert!(!store.is_blocked("203.0.113.9", EntryType::Ip));
    }
}
