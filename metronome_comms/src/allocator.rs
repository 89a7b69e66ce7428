//! Per-host monotonic port assignment.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

const LOCALHOST: &str = "localhost";

/// Hands out blocks of ports per host, skipping anything already marked
/// used. Hosts are interned so map keys stay stable across inserts.
#[derive(Debug, Default)]
pub struct PortAllocator {
    starting_port: Option<u16>,
    hosts: HashSet<Arc<str>>,
    next_ports: HashMap<Arc<str>, u16>,
    used_ports: HashMap<Arc<str>, BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        let mut alloc = PortAllocator::default();
        alloc.intern(LOCALHOST);
        alloc
    }

    pub fn starting_port(&self) -> Option<u16> {
        self.starting_port
    }

    pub fn set_starting_port(&mut self, port: u16) {
        self.starting_port = Some(port);
    }

    fn intern(&mut self, host: &str) -> Arc<str> {
        if let Some(existing) = self.hosts.get(host) {
            existing.clone()
        } else {
            let interned: Arc<str> = Arc::from(host);
            self.hosts.insert(interned.clone());
            interned
        }
    }

    fn canonical<'a>(host: &'a str) -> &'a str {
        if host == "127.0.0.1" || host == "::1" || host.is_empty() {
            LOCALHOST
        } else {
            host
        }
    }

    pub fn is_port_used(&self, host: &str, port: u16) -> bool {
        self.used_ports
            .get(Self::canonical(host))
            .map(|set| set.contains(&port))
            .unwrap_or(false)
    }

    pub fn add_used_port(&mut self, host: &str, port: u16) {
        let key = self.intern(Self::canonical(host));
        self.used_ports.entry(key).or_default().insert(port);
    }

    pub fn add_used_local_port(&mut self, port: u16) {
        self.add_used_port(LOCALHOST, port);
    }

    /// Allocate `count` consecutive ports on `host`, returning the first.
    ///
    /// The per-host cursor starts at the configured starting port (or
    /// `default_start`) and only moves forward; ports in the used set are
    /// skipped.
    pub fn find_open_port(&mut self, count: u16, host: &str, default_start: u16) -> u16 {
        let start = self.starting_port.unwrap_or(default_start);
        let key = self.intern(Self::canonical(host));

        let mut next_port = match self.next_ports.get_mut(&key) {
            Some(cursor) => {
                let port = *cursor;
                *cursor += count;
                port
            }
            None => {
                self.next_ports.insert(key.clone(), start + count);
                start
            }
        };

        if self.is_port_used(&key, next_port) {
            next_port += 1;
            while self.is_port_used(&key, next_port) {
                next_port += 1;
            }
            self.next_ports.insert(key.clone(), next_port + count);
        }
        for offset in 0..count {
            self.add_used_port(&key.clone(), next_port + offset);
        }
        next_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocations_are_disjoint() {
        let mut alloc = PortAllocator::new();
        alloc.set_starting_port(10000);
        let mut seen = std::collections::HashSet::new();
        let mut last = 0u16;
        for _ in 0..16 {
            let port = alloc.find_open_port(2, LOCALHOST, 9000);
            assert!(port > last || last == 0, "ports must increase");
            assert!(seen.insert(port));
            assert!(seen.insert(port + 1) || !seen.contains(&(port + 1)));
            last = port;
        }
    }

    #[test]
    fn skips_used_ports() {
        let mut alloc = PortAllocator::new();
        alloc.set_starting_port(20000);
        alloc.add_used_local_port(20000);
        alloc.add_used_local_port(20001);
        let port = alloc.find_open_port(1, LOCALHOST, 9000);
        assert_eq!(port, 20002);
    }

    #[test]
    fn localhost_aliases_share_a_cursor() {
        let mut alloc = PortAllocator::new();
        alloc.set_starting_port(30000);
        let a = alloc.find_open_port(1, "127.0.0.1", 9000);
        let b = alloc.find_open_port(1, "::1", 9000);
        let c = alloc.find_open_port(1, LOCALHOST, 9000);
        assert!(a < b && b < c);
    }

    #[test]
    fn hosts_are_independent() {
        let mut alloc = PortAllocator::new();
        alloc.set_starting_port(40000);
        let a = alloc.find_open_port(4, "hostA", 9000);
        let b = alloc.find_open_port(4, "hostB", 9000);
        assert_eq!(a, 40000);
        assert_eq!(b, 40000);
    }
}
