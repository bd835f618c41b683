use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::TcpListener,
    sync::{Arc, Mutex},
};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStats {
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization_percentage: f64,
}

/// Hands out ports from a fixed range, one holder per port.
///
/// The allocated set is authoritative for exclusivity. When `probe_system` is
/// set, ports already bound by some other process are skipped as well.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    probe_system: bool,
    allocated: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, probe_system: bool) -> Self {
        Self {
            range,
            probe_system,
            allocated: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn allocate(&self) -> Result<u16, AgentError> {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.range.start..=self.range.end {
            if allocated.contains(&port) {
                continue;
            }
            if self.probe_system && !port_is_bindable(port) {
                tracing::debug!(port, "skipping port bound outside the allocator");
                continue;
            }
            allocated.insert(port);
            tracing::debug!(port, allocated = allocated.len(), "port allocated");
            return Ok(port);
        }

        tracing::warn!(
            start = self.range.start,
            end = self.range.end,
            "port range exhausted"
        );
        Err(AgentError::ResourceExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Returns whether the port was held. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        if allocated.remove(&port) {
            tracing::debug!(port, "port released");
            true
        } else {
            tracing::warn!(port, "release of a port that is not allocated");
            false
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    pub fn stats(&self) -> PortStats {
        let allocated = self
            .allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let total = self.range.len();
        PortStats {
            total,
            allocated,
            available: total.saturating_sub(allocated),
            utilization_percentage: crate::support::percentage(allocated as u64, total as u64),
        }
    }
}

fn port_is_bindable(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            // Permission problems and the like: the renderer will hit the
            // same error, so treat the port as unusable.
            tracing::debug!(port, error = %e, "port probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange { start, end }, false)
    }

    #[test]
    fn allocates_distinct_ports_until_exhausted() {
        let ports = allocator(3000, 3002);
        let mut got = vec![
            ports.allocate().unwrap(),
            ports.allocate().unwrap(),
            ports.allocate().unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![3000, 3001, 3002]);

        let err = ports.allocate().unwrap_err();
        assert!(matches!(
            err,
            AgentError::ResourceExhausted {
                start: 3000,
                end: 3002
            }
        ));
    }

    #[test]
    fn release_makes_port_reusable() {
        let ports = allocator(4000, 4001);
        let a = ports.allocate().unwrap();
        let _b = ports.allocate().unwrap();
        assert!(ports.release(a));
        assert_eq!(ports.allocate().unwrap(), a);
    }

    #[test]
    fn release_of_unknown_port_is_noop() {
        let ports = allocator(4100, 4101);
        let a = ports.allocate().unwrap();
        assert!(!ports.release(4101));
        assert!(!ports.release(9));
        assert!(ports.is_allocated(a));
        assert_eq!(ports.stats().allocated, 1);

        assert!(ports.release(a));
        assert!(!ports.release(a));
        assert_eq!(ports.stats().allocated, 0);
    }

    #[test]
    fn stats_report_utilization() {
        let ports = allocator(5000, 5003);
        ports.allocate().unwrap();
        let stats = ports.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.utilization_percentage, 25.0);
    }

    #[test]
    fn concurrent_allocation_never_duplicates() {
        let ports = allocator(6000, 6049);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Ok(p) = ports.allocate() {
                        mine.push(p);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 50);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 50);
        assert!(all.iter().all(|p| (6000..=6049).contains(p)));
    }

    #[test]
    fn system_probe_skips_bound_ports() {
        let Ok(listener) = TcpListener::bind(("0.0.0.0", 0)) else {
            return;
        };
        let busy = listener.local_addr().unwrap().port();
        let ports = PortAllocator::new(
            PortRange {
                start: busy,
                end: busy,
            },
            true,
        );
        assert!(ports.allocate().is_err());
        drop(listener);
        assert_eq!(ports.allocate().unwrap(), busy);
    }
}
