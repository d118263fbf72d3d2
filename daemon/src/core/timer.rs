use std::sync::Arc;
use std::time::Instant;

use log::warn;
use tokio::time::sleep_until;

use super::device::Device;
use super::state::ConnState;

// Per-device watchdog. Each tick measures the oldest request that is
// still pending against the network and disk deadlines: a remote peer
// that fails to finish a request within ko-count times the timeout
// forces the connection into Timeout; a local disk that misses its
// deadline is escalated as a disk error.
pub fn spawn_request_timer(device: Arc<Device>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ent = device.net_conf.effective_net_timeout();
        let dt = device.disk_conf.disk_deadline();

        // effective tick is the shorter of the two deadlines
        let et = match dt {
            Some(dt) if dt < ent => dt,
            _ => ent,
        };
        if et.is_zero() {
            return;
        }

        let mut next = Instant::now() + et;
        while device.is_running() {
            sleep_until(tokio::time::Instant::from_std(next)).await;
            if !device.is_running() {
                return;
            }

            let Some((start, net_pending, local_pending)) = device.oldest_pending() else {
                next = Instant::now() + et;
                continue;
            };
            let now = Instant::now();

            if net_pending && now.saturating_duration_since(start) >= ent {
                warn!(
                    "{}: remote failed to finish a request within ko-count * timeout",
                    device.name()
                );
                if let Some(peer) = device.get_peer() {
                    peer.request_teardown(ConnState::Timeout);
                }
            }
            if local_pending {
                if let Some(dt) = dt {
                    if now.saturating_duration_since(start) >= dt {
                        warn!(
                            "{}: local backing device failed to meet the disk-timeout",
                            device.name()
                        );
                        device.force_disk_failure();
                    }
                }
            }

            // re-arm against the oldest request, never in the past
            next = if start + et <= now { now } else { start } + et;
        }
    })
}

impl Device {
    // Watchdog-driven disk error escalation: the device is unusable no
    // matter what the configured error policy says
    pub(crate) fn force_disk_failure(&self) {
        use super::state::DiskState;
        if self.get_disk_state() > DiskState::Failed {
            self.set_disk_state(DiskState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::config::{DiskConfig, NetConfig, WireProtocol};
    use crate::core::backing::MemBacking;
    use crate::core::bitmap::{MemActivityLog, MemBitmap};
    use crate::core::device::{Device, PeerDevice};
    use crate::core::metadata::MetaStore;
    use crate::core::request::{Bio, IoKind};
    use crate::core::state::{ConnState, Role};

    #[tokio::test]
    async fn test_watchdog_times_out_stuck_network_request() {
        // 2 ticks of 100ms each
        let net_conf = NetConfig {
            timeout: 1,
            ko_count: 2,
            ..NetConfig::default()
        };
        let device = Device::new(
            "vol0".to_string(),
            Role::Primary,
            net_conf,
            DiskConfig::default(),
            Arc::new(MemBacking::new(1 << 20)),
            Arc::new(MemBitmap::new()),
            Arc::new(MemActivityLog::new()),
            Arc::new(MetaStore::load_or_init(
                "/nonexistent/test.meta",
                Role::Primary,
            )),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = Arc::new(PeerDevice::new(WireProtocol::C, true, tx));
        device.attach_peer(Arc::clone(&peer));

        let _pending = device
            .submit(Bio {
                kind: IoKind::Write,
                sector: 0,
                size: 4096,
                data: Some(Bytes::from(vec![0u8; 4096])),
                hard_barrier: false,
            })
            .await;

        let handle = super::spawn_request_timer(Arc::clone(&device));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(peer.teardown_reason(), Some(ConnState::Timeout));
        device.shutdown();
        handle.abort();
    }
}
