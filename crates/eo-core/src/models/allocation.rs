use serde::{Deserialize, Serialize};

use super::template::ServiceKind;

/// First interval on the allocation grid.
pub const PORT_RANGE_BASE: u16 = 50000;
/// Interval size; also the grid step. Covers the max service span.
pub const PORT_RANGE_SIZE: u16 = 1000;
/// No interval may extend past this port.
pub const PORT_RANGE_CEILING: u16 = 65000;

/// A half-open port interval `[start, start + size)` owned by one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    pub run_id: String,
    pub start: u16,
    pub size: u16,
}

impl PortAllocation {
    pub fn end(&self) -> u16 {
        self.start + self.size
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end()
    }

    pub fn overlaps(&self, other: &PortAllocation) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Deterministic port for one replica of a service kind within this
    /// interval. Replicas occupy consecutive ports from the kind's offset.
    pub fn port_for(&self, kind: ServiceKind, replica: u32) -> u16 {
        self.start + kind.port_offset() + replica as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(start: u16) -> PortAllocation {
        PortAllocation {
            run_id: "r".into(),
            start,
            size: PORT_RANGE_SIZE,
        }
    }

    #[test]
    fn interval_is_half_open() {
        let a = alloc(50000);
        assert!(a.contains(50000));
        assert!(a.contains(50999));
        assert!(!a.contains(51000));
    }

    #[test]
    fn adjacent_intervals_do_not_overlap() {
        assert!(!alloc(50000).overlaps(&alloc(51000)));
        assert!(alloc(50000).overlaps(&alloc(50999)));
    }

    #[test]
    fn service_ports_are_spaced_within_the_interval() {
        let a = alloc(50000);
        assert_eq!(a.port_for(ServiceKind::Variation, 0), 50051);
        assert_eq!(a.port_for(ServiceKind::Variation, 1), 50052);
        assert_eq!(a.port_for(ServiceKind::Render, 0), 50061);
        assert_eq!(a.port_for(ServiceKind::Pyribs, 0), 50131);
    }
}
