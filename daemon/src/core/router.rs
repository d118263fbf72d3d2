use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use log::{debug, error, info, trace};
use tokio::sync::oneshot;

use crate::config::{OnCongestion, ReadBalancing, MAX_BIO_SIZE, SECTOR_SIZE};

use super::device::{Device, DeviceInner, EventOutcome, LocalSubmit, PeerDevice, RetryWork};
use super::interval::BlockInterval;
use super::request::{Bio, IoStatus, MasterBio, MasterResult, RequestEvent, RequestId};
use super::state::{ConnState, DiskState, ReplState, Role};

impl Device {
    // Entry point for upper-layer IO. The receiver resolves when the
    // request has been completed, one way or the other.
    pub async fn submit(self: &Arc<Self>, bio: Bio) -> oneshot::Receiver<MasterResult> {
        let (master, rx) = MasterBio::new();

        // we never supported hard barriers; flushes and FUA are handled
        // below us
        if bio.hard_barrier {
            master.complete(Err(IoStatus::NotSupported));
            return rx;
        }
        // what we otherwise blindly assume about a bio
        if bio.size == 0
            || bio.size % SECTOR_SIZE != 0
            || bio.size > MAX_BIO_SIZE
            || (bio.kind.is_write() && bio.data.as_ref().map(|d| d.len() as u32) != Some(bio.size))
        {
            master.complete(Err(IoStatus::NotSupported));
            return rx;
        }
        if self.get_role() != Role::Primary {
            error!("{}: IO submitted while {}", self.name(), self.get_role());
            master.complete(Err(IoStatus::Io));
            return rx;
        }

        self.make_request(bio, master).await;
        rx
    }

    // The request router: decides local-only, remote-only, both,
    // mark-out-of-sync, or reject, then sets the state machine going.
    // Also the re-entry point for postponed requests.
    pub(crate) async fn make_request(self: &Arc<Self>, bio: Bio, master: MasterBio) {
        let interval = BlockInterval::new(bio.sector, bio.size);
        let is_write = bio.kind.is_write();
        self.inc_ap_bio();

        // grab a reference on the backing device, if it is usable
        let has_private = self.get_disk_state() >= DiskState::Inconsistent;

        // For writes going to the local disk, pull the target extent
        // into the activity log. This may cost disk IO for the
        // transactional on-disk metadata update.
        let mut in_act_log = false;
        if is_write && has_private && !self.al_suspended.load(Ordering::SeqCst) {
            self.act_log.begin_io(&interval).await;
            in_act_log = true;
        }

        let mut outcome = EventOutcome::default();
        let mut guard = self.inner.lock().expect("req lock poisoned");

        let id = match self.allocate_request(&mut guard, bio.kind, interval, master, bio.data) {
            Ok(id) => id,
            Err(master) => {
                drop(guard);
                // only pass the error to the upper layers; if the
                // caller cannot handle IO errors, that is not our
                // business
                error!("{}: request table exhausted", self.name());
                if in_act_log {
                    self.act_log.complete_io(&interval);
                }
                outcome.completions.push((master, Err(IoStatus::NoMemory)));
                self.finish(outcome);
                return;
            }
        };
        {
            let req = guard.requests.get_mut(&id).expect("freshly allocated");
            req.has_private_bio = has_private;
            req.in_act_log = in_act_log;
        }

        if is_write {
            // this may temporarily give up the request lock, but will
            // re-acquire it before returning; needs to run before the
            // suspension check
            guard = self.complete_conflicting_writes(guard, &interval).await;
        }

        // no more giving up the lock from now on

        if self.is_suspended() {
            // push back and retry later
            let req = guard.requests.get_mut(&id).expect("allocated above");
            req.postponed = true;
            req.has_private_bio = false;
            self.req_may_be_completed(&mut guard, id, &mut outcome);
            drop(guard);
            self.finish(outcome);
            return;
        }

        // fail READs early if nothing can serve them; this must happen
        // before the request registers anywhere, or the completion
        // would queue it for a retry
        let mut read_peer: Option<Arc<PeerDevice>> = None;
        if !is_write {
            read_peer = self.find_peer_device_for_read(&mut guard, id);
            let has_private = guard
                .requests
                .get(&id)
                .map(|r| r.has_private_bio)
                .unwrap_or(false);
            if read_peer.is_none() && !has_private {
                error!("{}: IO ERROR: neither local nor remote disk", self.name());
                self.req_may_be_completed(&mut guard, id, &mut outcome);
                drop(guard);
                self.finish(outcome);
                return;
            }
        }

        // which transfer log epoch does this belong to?
        let epoch_nr = if is_write {
            guard.epochs.stamp_write()
        } else {
            guard.epochs.current_nr()
        };
        let tl_ok = guard.tl.append_request(id).is_ok();
        {
            let req = guard.requests.get_mut(&id).expect("allocated above");
            req.epoch_nr = epoch_nr;
            req.in_tl = tl_ok;
        }
        if !tl_ok {
            // capacity bug: fail fast instead of overwriting the ring
            let req = guard.requests.get_mut(&id).expect("allocated above");
            req.has_private_bio = false;
            self.req_may_be_completed(&mut guard, id, &mut outcome);
            drop(guard);
            self.finish(outcome);
            return;
        }

        let mut no_remote = false;
        if is_write {
            if self.process_write_request(&mut guard, id, &mut outcome) == 0 {
                no_remote = true;
            }
        } else if let Some(_peer) = read_peer {
            self.apply_event(&mut guard, id, RequestEvent::ToBeSent, &mut outcome);
            self.apply_event(&mut guard, id, RequestEvent::QueueForNetRead, &mut outcome);
        } else {
            no_remote = true;
        }

        let submit_local = guard
            .requests
            .get(&id)
            .map(|r| r.has_private_bio)
            .unwrap_or(false);
        if submit_local {
            // needs to be marked within the same lock section
            self.apply_event(&mut guard, id, RequestEvent::ToBeSubmitted, &mut outcome);
            let payload = guard.requests.get(&id).and_then(|r| r.payload.clone());
            let kind = bio.kind;
            drop(guard);
            self.finish(outcome);
            // once submitted we must no longer look at the request; it
            // may already have been destroyed by concurrent completions
            self.spawn_private_bio(LocalSubmit {
                id,
                kind,
                interval,
                payload,
            });
            return;
        }

        if no_remote {
            // a write may still have been queued for send-oos, so it
            // must go through the regular completion path
            debug!("{}: request {} has no path to data", self.name(), id);
        }

        self.req_may_be_completed(&mut guard, id, &mut outcome);
        drop(guard);
        self.finish(outcome);
    }

    // Wait for any conflicting in-flight writes to complete. The only
    // way out is their removal from the write interval tree.
    async fn complete_conflicting_writes<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DeviceInner>,
        interval: &BlockInterval,
    ) -> MutexGuard<'a, DeviceInner> {
        loop {
            if guard.write_requests.find_overlap(interval).is_none() {
                return guard;
            }
            trace!("{}: write {} waits for conflicting writes", self.name(), interval);
            // indicate that misc_wait should be woken on progress
            guard.write_requests.mark_conflicts_waiting(interval);
            let notified = self.misc_wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(guard);
            notified.await;
            guard = self.inner.lock().expect("req lock poisoned");
        }
    }

    // We may read locally if we are consistent, or still/already in
    // sync for this particular area
    fn may_do_local_read(&self, interval: &BlockInterval) -> bool {
        match self.get_disk_state() {
            DiskState::UpToDate => true,
            DiskState::Inconsistent => self.bitmap.count_bits_in(interval) == 0,
            _ => false,
        }
    }

    // Pick where a read should be served from. Drops the private bio
    // when the local disk cannot serve the range; returns the peer to
    // ask for data, or None to submit locally.
    fn find_peer_device_for_read(
        &self,
        guard: &mut MutexGuard<'_, DeviceInner>,
        id: RequestId,
    ) -> Option<Arc<PeerDevice>> {
        let (mut has_private, sector, interval) = {
            let req = guard.requests.get(&id)?;
            (req.has_private_bio, req.interval.sector, req.interval)
        };

        if has_private && !self.may_do_local_read(&interval) {
            let req = guard.requests.get_mut(&id)?;
            req.has_private_bio = false;
            has_private = false;
        }

        let rbm = self.net_conf.read_balancing;
        if rbm == ReadBalancing::PreferLocal && has_private {
            // submit locally
            return None;
        }

        let peer = self.get_peer()?;
        if peer.get_disk_state() != DiskState::UpToDate {
            return None;
        }
        if !has_private || self.remote_due_to_read_balancing(guard, &peer, sector, rbm) {
            Some(peer)
        } else {
            None
        }
    }

    fn remote_due_to_read_balancing(
        &self,
        guard: &mut MutexGuard<'_, DeviceInner>,
        peer: &PeerDevice,
        sector: u64,
        rbm: ReadBalancing,
    ) -> bool {
        match rbm {
            ReadBalancing::CongestedRemote => self.backing.is_congested(),
            ReadBalancing::LeastPending => {
                self.local_cnt.load(Ordering::SeqCst) > peer.ap_pending() + peer.rs_pending()
            }
            ReadBalancing::RoundRobin => {
                let previous = guard.read_balance_rr;
                guard.read_balance_rr = !previous;
                previous
            }
            ReadBalancing::PreferRemote => true,
            ReadBalancing::PreferLocal => false,
            striping => {
                let shift = striping.stripe_shift().unwrap_or(15);
                (sector >> (shift - 9)) & 1 == 1
            }
        }
    }

    fn should_do_remote(&self, peer: &PeerDevice) -> bool {
        let peer_disk = peer.get_disk_state();
        peer_disk == DiskState::UpToDate
            || (peer_disk == DiskState::Inconsistent
                && peer.get_repl_state() == ReplState::SyncTarget)
    }

    fn should_send_out_of_sync(&self, peer: &PeerDevice) -> bool {
        peer.get_repl_state() == ReplState::Ahead
    }

    // Returns the number of connections expected to actually carry the
    // data, which does not include any we run ahead of
    pub(crate) fn process_write_request(
        &self,
        guard: &mut MutexGuard<'_, DeviceInner>,
        id: RequestId,
        outcome: &mut EventOutcome,
    ) -> u32 {
        let Some(peer) = self.get_peer() else {
            return 0;
        };

        let mut remote = self.should_do_remote(&peer);
        if remote {
            self.check_congestion(guard, &peer);
            remote = self.should_do_remote(&peer);
        }
        let send_oos = self.should_send_out_of_sync(&peer);

        if !remote && !send_oos {
            return 0;
        }

        if remote {
            self.apply_event(guard, id, RequestEvent::ToBeSent, outcome);
            let interval = guard.requests[&id].interval;
            guard.write_requests.insert(id, interval);
            if let Some(req) = guard.requests.get_mut(&id) {
                req.in_write_tree = true;
            }
            self.apply_event(guard, id, RequestEvent::QueueForNetWrite, outcome);
            1
        } else {
            let interval = guard.requests[&id].interval;
            self.bitmap.set_out_of_sync(&interval);
            self.apply_event(guard, id, RequestEvent::QueueForSendOos, outcome);
            0
        }
    }

    // When the mirror cannot keep up, either start running ahead of it
    // or cut the connection; both start with a fresh epoch for the
    // non-mirrored writes
    fn check_congestion(&self, guard: &mut MutexGuard<'_, DeviceInner>, peer: &PeerDevice) {
        let conf = &self.net_conf;
        if conf.on_congestion == OnCongestion::Block {
            return;
        }

        let mut congested = false;
        if conf.cong_fill > 0 && peer.ap_in_flight() >= conf.cong_fill as u64 {
            info!("{}: congestion-fill threshold reached", self.name());
            congested = true;
        }
        if conf.cong_extents > 0 && self.act_log.used() >= conf.cong_extents {
            info!("{}: congestion-extents threshold reached", self.name());
            congested = true;
        }

        if congested {
            if guard.epochs.current_writes() > 0 {
                self.close_epoch(guard);
            }
            match conf.on_congestion {
                OnCongestion::PullAhead => peer.set_repl_state(ReplState::Ahead),
                OnCongestion::Disconnect => peer.request_teardown(ConnState::Unconnected),
                OnCongestion::Block => {}
            }
        }
    }

    // Long-lived per-device workers: the retry queue drain and the
    // request watchdog
    pub fn spawn_workers(self: &Arc<Self>) {
        if let Some(mut rx) = self.take_retry_rx() {
            let device = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(work) = rx.recv().await {
                    if !device.is_running() {
                        break;
                    }
                    // postponed work stays parked while IO is suspended
                    device.wait_resumed().await;
                    let RetryWork {
                        kind,
                        interval,
                        payload,
                        master,
                    } = work;
                    debug!("{}: restarting postponed request {}", device.name(), interval);
                    let bio = Bio {
                        kind,
                        sector: interval.sector,
                        size: interval.size,
                        data: payload,
                        hard_barrier: false,
                    };
                    device.make_request(bio, master).await;
                }
            });
        }
        super::timer::spawn_request_timer(Arc::clone(self));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::timeout;

    use crate::config::{DiskConfig, NetConfig, WireProtocol};
    use crate::core::backing::MemBacking;
    use crate::core::bitmap::{MemActivityLog, MemBitmap, SyncBitmap};
    use crate::core::device::{Device, PeerDevice, SendWork};
    use crate::core::interval::BlockInterval;
    use crate::core::metadata::MetaStore;
    use crate::core::request::{Bio, IoKind, IoStatus, RequestEvent, RequestId};
    use crate::core::state::{DiskState, Role};

    fn build_device(protocol: WireProtocol) -> (Arc<Device>, UnboundedReceiver<SendWork>) {
        let net_conf = NetConfig {
            wire_protocol: protocol,
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
        let (tx, rx) = mpsc::unbounded_channel();
        device.attach_peer(Arc::new(PeerDevice::new(protocol, true, tx)));
        (device, rx)
    }

    fn write_bio(sector: u64, size: u32) -> Bio {
        Bio {
            kind: IoKind::Write,
            sector,
            size,
            data: Some(Bytes::from(vec![0xA5u8; size as usize])),
            hard_barrier: false,
        }
    }

    fn read_bio(sector: u64, size: u32) -> Bio {
        Bio {
            kind: IoKind::Read,
            sector,
            size,
            data: None,
            hard_barrier: false,
        }
    }

    async fn next_data_work(rx: &mut UnboundedReceiver<SendWork>) -> RequestId {
        loop {
            match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
                Some(SendWork::Data(id)) => return id,
                Some(_) => continue,
                None => panic!("sender queue closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_malformed_bios() {
        let (device, _work) = build_device(WireProtocol::C);

        let rx = device.submit(write_bio(0, 0)).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::NotSupported));

        let mut bio = write_bio(0, 4096);
        bio.size = 1000; // not a sector multiple
        bio.data = Some(Bytes::from(vec![0u8; 1000]));
        let rx = device.submit(bio).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::NotSupported));

        let mut bio = write_bio(0, 4096);
        bio.hard_barrier = true;
        let rx = device.submit(bio).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::NotSupported));
    }

    #[tokio::test]
    async fn test_protocol_c_happy_path() {
        let (device, mut work) = build_device(WireProtocol::C);

        let rx1 = device.submit(write_bio(0, 4096)).await;
        let rx2 = device.submit(write_bio(8, 4096)).await;

        let id1 = next_data_work(&mut work).await;
        let id2 = next_data_work(&mut work).await;

        device.req_event(id1, RequestEvent::HandedOverToNetwork);
        device.req_event(id2, RequestEvent::HandedOverToNetwork);
        device.req_event(id1, RequestEvent::WriteAckedByPeer);
        device.req_event(id2, RequestEvent::WriteAckedByPeer);

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());

        // both were in epoch 1; the soft close moved the counter on
        device.barrier_ack(1, 2).unwrap();
        let inner = device.inner.lock().unwrap();
        assert!(inner.epochs.current_nr() > 1);
        assert!(inner.requests.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_a_completes_on_handover() {
        let (device, mut work) = build_device(WireProtocol::A);

        let rx = device.submit(write_bio(0, 4096)).await;
        let id = next_data_work(&mut work).await;

        // no ack of any kind, only the hand-over to the socket
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        assert!(timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_conflicting_writes_serialize() {
        let (device, mut work) = build_device(WireProtocol::C);

        // W_a covers sectors 0..16, W_b overlaps at 8..16
        let rx_a = device.submit(write_bio(0, 8192)).await;
        let id_a = next_data_work(&mut work).await;

        let device2 = Arc::clone(&device);
        let handle =
            tokio::spawn(async move { device2.submit(write_bio(8, 4096)).await });

        // W_b must be parked in the conflict wait, not on the queue
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(work.try_recv().is_err());

        // complete W_a fully
        device.req_event(id_a, RequestEvent::HandedOverToNetwork);
        device.req_event(id_a, RequestEvent::WriteAckedByPeer);
        assert!(rx_a.await.unwrap().is_ok());

        // now W_b proceeds
        let rx_b = handle.await.unwrap();
        let id_b = next_data_work(&mut work).await;
        device.req_event(id_b, RequestEvent::HandedOverToNetwork);
        device.req_event(id_b, RequestEvent::WriteAckedByPeer);
        assert!(rx_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_read_routes_remote_when_local_stale() {
        let (device, mut work) = build_device(WireProtocol::C);

        // local disk is inconsistent and the range is known stale
        device.set_disk_state(DiskState::Inconsistent);
        device
            .bitmap
            .set_out_of_sync(&BlockInterval::new(0, 4096));

        let rx = device.submit(read_bio(0, 4096)).await;
        let id = match timeout(Duration::from_secs(1), work.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SendWork::ReadRequest(id) => id,
            other => panic!("expected read request, got {:?}", other),
        };

        device.req_event(id, RequestEvent::HandedOverToNetwork);
        let payload = Bytes::from(vec![0x42u8; 4096]);
        device.data_received(id, payload.clone());

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, Some(payload));
    }

    #[tokio::test]
    async fn test_read_fails_with_no_path() {
        let (device, _work) = build_device(WireProtocol::C);
        device.set_disk_state(DiskState::Diskless);
        device.detach_peer();

        let rx = device.submit(read_bio(0, 4096)).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::Io));
    }

    #[tokio::test]
    async fn test_local_only_write_without_peer() {
        let (device, _work) = build_device(WireProtocol::C);
        device.detach_peer();

        let rx = device.submit(write_bio(0, 4096)).await;
        assert!(timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_suspended_write_retries_after_resume() {
        let (device, mut work) = build_device(WireProtocol::C);
        device.spawn_workers();
        device.suspend();

        let rx = device.submit(write_bio(0, 4096)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // parked: neither completed nor queued
        assert!(work.try_recv().is_err());

        device.resume();
        let id = next_data_work(&mut work).await;
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.req_event(id, RequestEvent::WriteAckedByPeer);
        assert!(timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
        device.shutdown();
    }

    #[tokio::test]
    async fn test_transfer_log_exhaustion_fails_fast() {
        let net_conf = NetConfig {
            wire_protocol: WireProtocol::C,
            tl_size: 0,
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
        let (tx, _work) = mpsc::unbounded_channel();
        device.attach_peer(Arc::new(PeerDevice::new(WireProtocol::C, true, tx)));

        // the ring refuses the entry and the IO fails instead of
        // overwriting older log entries
        let rx = device.submit(write_bio(0, 4096)).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::Io));
    }

    #[tokio::test]
    async fn test_request_table_exhaustion_is_no_memory() {
        let (device, _work) = {
            let net_conf = NetConfig {
                wire_protocol: WireProtocol::C,
                max_requests: 0,
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
            let (tx, rx) = mpsc::unbounded_channel();
            device.attach_peer(Arc::new(PeerDevice::new(WireProtocol::C, true, tx)));
            (device, rx)
        };

        let rx = device.submit(write_bio(0, 4096)).await;
        assert_eq!(rx.await.unwrap(), Err(IoStatus::NoMemory));
    }
}
