//! Ketama-style consistent-hash ring. Each host contributes a fixed
//! number of virtual points so keys spread evenly and membership changes
//! only remap the keys that hashed near the affected host.

use std::collections::BTreeMap;

const VIRTUAL_NODES: usize = 100;

#[derive(Debug, Default)]
pub(crate) struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, host: &str) {
        for replica in 0..VIRTUAL_NODES {
            self.points
                .insert(hash(&point_key(host, replica)), host.to_owned());
        }
    }

    pub(crate) fn remove(&mut self, host: &str) {
        for replica in 0..VIRTUAL_NODES {
            let point = hash(&point_key(host, replica));
            if self.points.get(&point).is_some_and(|h| h == host) {
                self.points.remove(&point);
            }
        }
    }

    /// The host owning `key`: the first ring point at or clockwise after
    /// the key's hash. `None` when the ring is empty.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let at = hash(key);
        self.points
            .range(at..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, host)| host.as_str())
    }
}

fn point_key(host: &str, replica: usize) -> String {
    format!("{host}-{replica}")
}

fn hash(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    u64::from_le_bytes(
        digest.as_bytes()[..8]
            .try_into()
            .expect("digest is at least 8 bytes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_has_no_host() {
        assert_eq!(HashRing::new().get("rtsp://cam/1"), None);
    }

    #[test]
    fn lookup_is_deterministic() {
        let mut ring = HashRing::new();
        ring.add("a");
        ring.add("b");
        ring.add("c");

        let first = ring.get("rtsp://cam/1").unwrap().to_owned();
        for _ in 0..10 {
            assert_eq!(ring.get("rtsp://cam/1").unwrap(), first);
        }
    }

    #[test]
    fn removing_a_host_keeps_other_assignments_stable() {
        let mut ring = HashRing::new();
        ring.add("a");
        ring.add("b");
        ring.add("c");

        let keys: Vec<String> = (0..200).map(|i| format!("rtsp://cam/{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|key| ring.get(key).unwrap().to_owned())
            .collect();

        ring.remove("b");

        for (key, owner) in keys.iter().zip(&before) {
            let now = ring.get(key).unwrap();
            if owner != "b" {
                assert_eq!(now, owner);
            } else {
                assert_ne!(now, "b");
            }
        }
    }

    #[test]
    fn single_host_owns_everything() {
        let mut ring = HashRing::new();
        ring.add("only");
        for i in 0..50 {
            assert_eq!(ring.get(&format!("key-{i}")).unwrap(), "only");
        }
    }

    #[test]
    fn hosts_share_the_keyspace() {
        let mut ring = HashRing::new();
        ring.add("a");
        ring.add("b");

        let mut owners: Vec<&str> = Vec::new();
        let keys: Vec<String> = (0..200).map(|i| format!("rtsp://cam/{i}")).collect();
        for key in &keys {
            owners.push(ring.get(key).unwrap());
        }
        assert!(owners.contains(&"a"));
        assert!(owners.contains(&"b"));
    }
}
