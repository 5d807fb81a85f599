//! Live service directory, push-fed by the router.
//!
//! The router announces every service registration and removal over
//! the gateway's router link, so resolution here never blocks on a
//! round trip. A service may advertise a comma-separated list of
//! logical names; candidate lookup matches any element of that list.

use dashmap::DashMap;
use tracing::{debug, info};

use cluster_core::protocol::ServiceNotice;

/// One live backend instance as announced by the router.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Advertised name, possibly a comma-separated list.
    pub name: String,
    pub addr: String,
    pub weight: i32,
    pub min_weight: i32,
    pub max_weight: i32,
}

impl ServiceEntry {
    /// Whether the advertised name list contains `logical`.
    pub fn serves(&self, logical: &str) -> bool {
        self.name.split(',').any(|n| n.trim() == logical)
    }
}

/// All backend instances the router has announced, keyed by their
/// full advertised name.
#[derive(Default)]
pub struct ServiceDirectory {
    entries: DashMap<String, ServiceEntry>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a "service available" notice; replaces any previous
    /// entry under the same advertised name.
    pub fn apply_available(&self, notice: ServiceNotice) {
        info!("📡 service available: {} ({})", notice.name, notice.addr);
        self.entries.insert(
            notice.name.clone(),
            ServiceEntry {
                name: notice.name,
                addr: notice.addr,
                weight: notice.weight,
                min_weight: notice.min_weight,
                max_weight: notice.max_weight,
            },
        );
    }

    /// Applies a "service unavailable" notice.
    pub fn apply_unavailable(&self, name: &str) {
        if self.entries.remove(name).is_some() {
            info!("📴 service unavailable: {name}");
        } else {
            debug!("unavailable notice for unknown service {name}");
        }
    }

    /// Exact lookup by full advertised name.
    pub fn exact(&self, name: &str) -> Option<ServiceEntry> {
        self.entries.get(name).map(|e| e.clone())
    }

    /// Every entry whose advertised name list contains `logical`,
    /// sorted by advertised name for deterministic selection.
    pub fn candidates_for(&self, logical: &str) -> Vec<ServiceEntry> {
        let mut found: Vec<ServiceEntry> = self
            .entries
            .iter()
            .filter(|e| e.serves(logical))
            .map(|e| e.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Resolves a full advertised name to its address.
    pub fn addr_of(&self, name: &str) -> Option<String> {
        self.exact(name).map(|e| e.addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(name: &str, addr: &str, weight: i32) -> ServiceNotice {
        ServiceNotice {
            name: name.to_string(),
            addr: addr.to_string(),
            weight,
            min_weight: 0,
            max_weight: 0,
        }
    }

    #[test]
    fn available_then_unavailable() {
        let directory = ServiceDirectory::new();
        directory.apply_available(notice("room", "10.0.0.2:7001", 1));
        assert_eq!(directory.addr_of("room"), Some("10.0.0.2:7001".to_string()));

        directory.apply_unavailable("room");
        assert_eq!(directory.addr_of("room"), None);
    }

    #[test]
    fn comma_lists_match_each_logical_name() {
        let directory = ServiceDirectory::new();
        directory.apply_available(notice("room,chat", "10.0.0.2:7001", 1));
        directory.apply_available(notice("chat", "10.0.0.3:7001", 2));

        let chat = directory.candidates_for("chat");
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].addr, "10.0.0.3:7001");
        assert_eq!(chat[1].addr, "10.0.0.2:7001");

        let room = directory.candidates_for("room");
        assert_eq!(room.len(), 1);

        assert!(directory.candidates_for("mail").is_empty());
    }

    #[test]
    fn list_elements_match_whole_names_only() {
        let directory = ServiceDirectory::new();
        directory.apply_available(notice("roomkeeper", "10.0.0.2:7001", 1));
        assert!(directory.candidates_for("room").is_empty());
    }

    #[test]
    fn reannouncement_replaces_the_entry() {
        let directory = ServiceDirectory::new();
        directory.apply_available(notice("room", "10.0.0.2:7001", 1));
        directory.apply_available(notice("room", "10.0.0.9:7001", 4));

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.addr_of("room"), Some("10.0.0.9:7001".to_string()));
    }
}
