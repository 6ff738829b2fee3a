//! Directed peer-access links between two devices.
//!
//! A [`PeerLink`] grants `current` direct read/write access into `peer`'s
//! memory for as long as the guard lives. Dropping the guard revokes the
//! access, so a link cannot outlive the run that created it, including when
//! the run bails out with an error.

use crate::runtime::AcceleratorRuntime;
use p2p_core::{DeviceId, DevicePair, P2pError, Result};

/// Grants `current` access into `peer`'s memory, with no flags.
///
/// Rejects `current == peer` before touching any device state.
pub fn enable_peer_access<R: AcceleratorRuntime>(
    runtime: &R,
    current: DeviceId,
    peer: DeviceId,
) -> Result<()> {
    if current == peer {
        return Err(P2pError::InvalidTopology { device: current });
    }
    log::info!("[PEER-LINK] Enabling {} -> {}", current, peer);
    runtime.enable_peer_access(current, peer)
}

/// Revokes access granted by [`enable_peer_access`].
pub fn disable_peer_access<R: AcceleratorRuntime>(
    runtime: &R,
    current: DeviceId,
    peer: DeviceId,
) -> Result<()> {
    if current == peer {
        return Err(P2pError::InvalidTopology { device: current });
    }
    log::info!("[PEER-LINK] Disabling {} -> {}", current, peer);
    runtime.disable_peer_access(current, peer)
}

/// Enabled link from `current` into `peer`; disabled on drop.
pub struct PeerLink<'r, R: AcceleratorRuntime> {
    runtime: &'r R,
    current: DeviceId,
    peer: DeviceId,
    active: bool,
}

impl<'r, R: AcceleratorRuntime> PeerLink<'r, R> {
    pub fn enable(runtime: &'r R, current: DeviceId, peer: DeviceId) -> Result<Self> {
        enable_peer_access(runtime, current, peer)?;
        Ok(Self {
            runtime,
            current,
            peer,
            active: true,
        })
    }

    /// Enables the link described by a discovered pair.
    pub fn for_pair(runtime: &'r R, pair: DevicePair) -> Result<Self> {
        Self::enable(runtime, pair.current, pair.peer)
    }

    /// Device holding the access (destination of peer copies).
    pub fn current(&self) -> DeviceId {
        self.current
    }

    /// Device whose memory is exposed (source of peer copies).
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// Disables the link now and reports failure, instead of logging it on drop.
    pub fn disable(mut self) -> Result<()> {
        self.active = false;
        disable_peer_access(self.runtime, self.current, self.peer)
    }
}

impl<R: AcceleratorRuntime> Drop for PeerLink<'_, R> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = disable_peer_access(self.runtime, self.current, self.peer) {
                log::error!(
                    "[PEER-LINK] Failed to disable {} -> {} on drop: {}",
                    self.current,
                    self.peer,
                    e
                );
            }
        }
    }
}
