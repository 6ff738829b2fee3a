//! Device topology discovery.
//!
//! Finds the first pair of devices, in a fixed scan order, where one device
//! can access the other's memory directly. The result depends only on the
//! device count and the pairwise capability, never on timing.

use crate::runtime::AcceleratorRuntime;
use p2p_core::{DeviceId, DevicePair, P2pError, Result};
use std::fmt;

/// Directed peer-capability matrix: `can_access(d, p)` means `d` can map `p`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMatrix {
    device_count: usize,
    access: Vec<bool>,
}

impl PeerMatrix {
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn can_access(&self, device: DeviceId, peer: DeviceId) -> bool {
        device.0 < self.device_count
            && peer.0 < self.device_count
            && self.access[device.0 * self.device_count + peer.0]
    }

    /// Number of capable ordered pairs.
    pub fn capable_pairs(&self) -> usize {
        self.access.iter().filter(|&&a| a).count()
    }
}

impl fmt::Display for PeerMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "     ")?;
        for p in 0..self.device_count {
            write!(f, " {:>5}", DeviceId(p).to_string())?;
        }
        for d in 0..self.device_count {
            write!(f, "\n{:>5}", DeviceId(d).to_string())?;
            for p in 0..self.device_count {
                let cell = if d == p {
                    "-"
                } else if self.can_access(DeviceId(d), DeviceId(p)) {
                    "P2P"
                } else {
                    "."
                };
                write!(f, " {:>5}", cell)?;
            }
        }
        Ok(())
    }
}

/// Queries peer capability for every ordered pair of distinct devices.
pub fn probe_matrix<R: AcceleratorRuntime>(runtime: &R) -> Result<PeerMatrix> {
    let device_count = runtime.device_count()?;
    let mut access = vec![false; device_count * device_count];

    for d in 0..device_count {
        for p in 0..device_count {
            if d != p {
                access[d * device_count + p] = runtime.can_access_peer(DeviceId(d), DeviceId(p))?;
            }
        }
    }

    Ok(PeerMatrix {
        device_count,
        access,
    })
}

/// Returns the first `(current, peer)` with `peer < current` where `current`
/// can access `peer`, scanning `current` upward from 0 and, for each,
/// `peer` upward from 0.
///
/// # Errors
/// - `InsufficientDevices` with fewer than two devices
/// - `NoPeerAccess` when no pair qualifies
pub fn discover_pair<R: AcceleratorRuntime>(runtime: &R) -> Result<DevicePair> {
    let device_count = runtime.device_count()?;
    log::info!(
        "[TOPOLOGY] {} backend reports {} device(s)",
        runtime.name(),
        device_count
    );

    if device_count < 2 {
        return Err(P2pError::InsufficientDevices {
            found: device_count,
        });
    }

    for current in 0..device_count {
        for peer in 0..current {
            let (current, peer) = (DeviceId(current), DeviceId(peer));
            if runtime.can_access_peer(current, peer)? {
                log::info!("[TOPOLOGY] Selected pair {} can access {}", current, peer);
                return Ok(DevicePair { current, peer });
            }
            log::debug!("[TOPOLOGY] {} cannot access {}", current, peer);
        }
    }

    Err(P2pError::NoPeerAccess { device_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRuntime;

    #[test]
    fn test_fewer_than_two_devices() {
        for count in [0, 1] {
            let rt = SimulatedRuntime::fully_connected(count);
            assert!(matches!(
                discover_pair(&rt),
                Err(P2pError::InsufficientDevices { found }) if found == count
            ));
        }
    }

    #[test]
    fn test_no_capable_pair() {
        let rt = SimulatedRuntime::isolated(4);
        assert!(matches!(
            discover_pair(&rt),
            Err(P2pError::NoPeerAccess { device_count: 4 })
        ));
    }

    #[test]
    fn test_first_pair_in_scan_order() {
        let rt = SimulatedRuntime::fully_connected(4);
        let pair = discover_pair(&rt).unwrap();
        assert_eq!(pair.current, DeviceId(1));
        assert_eq!(pair.peer, DeviceId(0));
    }

    #[test]
    fn test_only_lower_peers_are_scanned() {
        // 0 can access 1, but 1 cannot access 0: the scan only asks 1 about 0.
        let rt = SimulatedRuntime::new(3, [(0, 1), (2, 1)]);
        let pair = discover_pair(&rt).unwrap();
        assert_eq!(pair, DevicePair { current: DeviceId(2), peer: DeviceId(1) });
        assert!(pair.peer < pair.current);
    }

    #[test]
    fn test_discovery_is_deterministic() {
        let rt = SimulatedRuntime::new(5, [(3, 0), (4, 2), (2, 1)]);
        let first = discover_pair(&rt).unwrap();
        for _ in 0..10 {
            assert_eq!(discover_pair(&rt).unwrap(), first);
        }
        assert_eq!(first, DevicePair { current: DeviceId(2), peer: DeviceId(1) });
    }

    #[test]
    fn test_probe_matrix() {
        let rt = SimulatedRuntime::new(3, [(1, 0), (0, 1)]);
        let matrix = probe_matrix(&rt).unwrap();
        assert_eq!(matrix.capable_pairs(), 2);
        assert!(matrix.can_access(DeviceId(1), DeviceId(0)));
        assert!(!matrix.can_access(DeviceId(2), DeviceId(0)));
        assert!(!matrix.can_access(DeviceId(7), DeviceId(0)));
        assert!(matrix.to_string().contains("P2P"));
    }
}
