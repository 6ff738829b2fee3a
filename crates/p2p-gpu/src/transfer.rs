//! Inter-device transfers.
//!
//! [`copy_peer`] is the direct path and needs a live [`PeerLink`] whose
//! `current` device owns the destination. [`copy_staged`] bounces through
//! host memory and works between any two devices; it is only used when
//! asked for explicitly.

use crate::peer_link::PeerLink;
use crate::runtime::{AcceleratorRuntime, DeviceBuffer};
use p2p_core::{P2pError, Result};

fn check_extent<B: DeviceBuffer>(dst: &B, src: &B, size_bytes: usize) -> Result<()> {
    let elem = std::mem::size_of::<f32>();
    if size_bytes % elem != 0 {
        return Err(P2pError::transfer(format!(
            "{} bytes is not a whole number of f32 elements",
            size_bytes
        )));
    }
    if size_bytes > src.size_bytes() || size_bytes > dst.size_bytes() {
        return Err(P2pError::transfer(format!(
            "{} bytes exceeds source ({}B on {}) or destination ({}B on {})",
            size_bytes,
            src.size_bytes(),
            src.device(),
            dst.size_bytes(),
            dst.device()
        )));
    }
    Ok(())
}

/// Queues a direct copy of `size_bytes` from `src` (on the link's peer) into
/// `dst` (on the link's current device), on the destination's queue.
///
/// The source device must already be synchronized; the copy is asynchronous
/// with respect to the host.
pub fn copy_peer<R: AcceleratorRuntime>(
    runtime: &R,
    link: &PeerLink<'_, R>,
    dst: &mut R::Buffer,
    src: &R::Buffer,
    size_bytes: usize,
) -> Result<()> {
    if dst.device() != link.current() || src.device() != link.peer() {
        return Err(P2pError::transfer(format!(
            "copy {} -> {} does not follow the enabled link {} <- {}",
            src.device(),
            dst.device(),
            link.current(),
            link.peer()
        )));
    }
    check_extent(dst, src, size_bytes)?;

    log::debug!(
        "[TRANSFER] peer copy {}B {} -> {}",
        size_bytes,
        src.device(),
        dst.device()
    );
    runtime.copy_peer(dst, src, size_bytes)
}

/// Copies `size_bytes` from `src` into `dst` through a host buffer.
///
/// Blocks until `src`'s device has drained; the upload into `dst` is queued
/// on `dst`'s device.
pub fn copy_staged<R: AcceleratorRuntime>(
    runtime: &R,
    dst: &mut R::Buffer,
    src: &R::Buffer,
    size_bytes: usize,
) -> Result<()> {
    check_extent(dst, src, size_bytes)?;

    log::debug!(
        "[TRANSFER] staged copy {}B {} -> host -> {}",
        size_bytes,
        src.device(),
        dst.device()
    );
    let host = runtime.download(src)?;
    let len = size_bytes / std::mem::size_of::<f32>();
    runtime.write(dst, &host[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEvent, SimulatedRuntime};
    use p2p_core::DeviceId;

    #[test]
    fn test_copy_peer_follows_link_direction() {
        let rt = SimulatedRuntime::fully_connected(2);
        let link = PeerLink::enable(&rt, DeviceId(1), DeviceId(0)).unwrap();
        let src = rt.upload(DeviceId(0), &[1.0, 2.0, 3.0]).unwrap();
        let mut dst = rt.alloc(DeviceId(1), 3).unwrap();

        copy_peer(&rt, &link, &mut dst, &src, 12).unwrap();
        assert_eq!(rt.download(&dst).unwrap(), vec![1.0, 2.0, 3.0]);

        // Reverse direction is not covered by this link.
        let mut back = rt.alloc(DeviceId(0), 3).unwrap();
        assert!(matches!(
            copy_peer(&rt, &link, &mut back, &dst, 12),
            Err(P2pError::Transfer(_))
        ));
    }

    #[test]
    fn test_copy_peer_checks_extent() {
        let rt = SimulatedRuntime::fully_connected(2);
        let link = PeerLink::enable(&rt, DeviceId(1), DeviceId(0)).unwrap();
        let src = rt.upload(DeviceId(0), &[1.0; 4]).unwrap();
        let mut dst = rt.alloc(DeviceId(1), 2).unwrap();

        assert!(copy_peer(&rt, &link, &mut dst, &src, 16).is_err());
        assert!(copy_peer(&rt, &link, &mut dst, &src, 6).is_err());
        assert!(!rt
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::PeerCopy { .. })));
    }

    #[test]
    fn test_partial_copy_leaves_tail() {
        let rt = SimulatedRuntime::fully_connected(2);
        let link = PeerLink::enable(&rt, DeviceId(1), DeviceId(0)).unwrap();
        let src = rt.upload(DeviceId(0), &[7.0; 4]).unwrap();
        let mut dst = rt.upload(DeviceId(1), &[0.0; 4]).unwrap();

        copy_peer(&rt, &link, &mut dst, &src, 8).unwrap();
        assert_eq!(rt.download(&dst).unwrap(), vec![7.0, 7.0, 0.0, 0.0]);
    }

    #[test]
    fn test_staged_copy_needs_no_link() {
        let rt = SimulatedRuntime::isolated(2);
        let src = rt.upload(DeviceId(0), &[4.0, 5.0]).unwrap();
        let mut dst = rt.alloc(DeviceId(1), 2).unwrap();

        copy_staged(&rt, &mut dst, &src, 8).unwrap();
        assert_eq!(rt.download(&dst).unwrap(), vec![4.0, 5.0]);
        assert!(rt.enabled_links().is_empty());
    }
}
