use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use indexmap::IndexMap;
use log::{debug, error, trace, warn};
use metrics::counter;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::config::{DiskConfig, NetConfig, OnIoError, WireProtocol};

use super::backing::BackingStore;
use super::bitmap::{ActivityLog, SyncBitmap};
use super::epoch::EpochController;
use super::interval::{BlockInterval, IntervalMap};
use super::metadata::MetaStore;
use super::request::{
    ExpectedAck, IoKind, IoStatus, LocalFate, MasterBio, MasterResult, NetPhase, Request,
    RequestEvent, RequestId,
};
use super::state::{ConnState, DiskState, ReplState, Role};
use super::transfer_log::{TlEntry, TlError, TransferLog};

// Work items on a connection's sender queue. A request sits on at most
// one queue at a time (its net phase is Queued exactly then).
#[derive(Debug)]
pub enum SendWork {
    // Mirror a write's payload
    Data(RequestId),
    // Ask the peer for block data
    ReadRequest(RequestId),
    // Tell the peer a range went stale without shipping data
    Oos(RequestId),
    // Answer a peer's read (secondary side)
    Reply {
        sector: u64,
        block_id: u64,
        data: Bytes,
    },
}

// A postponed request on its way back through the router
pub struct RetryWork {
    pub kind: IoKind,
    pub interval: BlockInterval,
    pub payload: Option<Bytes>,
    pub master: MasterBio,
}

// How to dispose of in-flight network state when a connection dies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    // The peer did not restart: keep un-acked writes for replay
    Resend,
    // Evidence is gone: fail the network part of everything
    Fail,
}

// One per (device, remote peer) pair. Created when a connection is
// established, dropped only once no request references it.
pub struct PeerDevice {
    protocol: WireProtocol,
    // We initiated the TCP connection; also decides write conflicts
    outgoing: bool,
    repl_state: Mutex<ReplState>,
    disk_state: Mutex<DiskState>,
    ap_pending: AtomicU32,
    rs_pending: AtomicU32,
    // Sectors handed to the wire but not yet settled
    ap_in_flight: AtomicU64,
    sender: UnboundedSender<SendWork>,
    teardown_reason: Mutex<Option<ConnState>>,
    teardown: Notify,
}

impl PeerDevice {
    pub fn new(protocol: WireProtocol, outgoing: bool, sender: UnboundedSender<SendWork>) -> Self {
        Self {
            protocol,
            outgoing,
            repl_state: Mutex::new(ReplState::Established),
            disk_state: Mutex::new(DiskState::UpToDate),
            ap_pending: AtomicU32::new(0),
            rs_pending: AtomicU32::new(0),
            ap_in_flight: AtomicU64::new(0),
            sender,
            teardown_reason: Mutex::new(None),
            teardown: Notify::new(),
        }
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    pub fn is_out(&self) -> bool {
        self.outgoing
    }

    pub fn get_repl_state(&self) -> ReplState {
        *self.repl_state.lock().expect("repl state lock poisoned")
    }

    pub fn set_repl_state(&self, state: ReplState) {
        *self.repl_state.lock().expect("repl state lock poisoned") = state;
    }

    pub fn get_disk_state(&self) -> DiskState {
        *self.disk_state.lock().expect("peer disk state lock poisoned")
    }

    pub fn set_disk_state(&self, state: DiskState) {
        *self.disk_state.lock().expect("peer disk state lock poisoned") = state;
    }

    pub fn ap_pending(&self) -> u32 {
        self.ap_pending.load(Ordering::SeqCst)
    }

    pub fn rs_pending(&self) -> u32 {
        self.rs_pending.load(Ordering::SeqCst)
    }

    pub fn ap_in_flight(&self) -> u64 {
        self.ap_in_flight.load(Ordering::SeqCst)
    }

    fn inc_ap_pending(&self) {
        self.ap_pending.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ap_pending(&self) {
        if self.ap_pending.fetch_sub(1, Ordering::SeqCst) == 0 {
            warn!("ap_pending underflow");
            self.ap_pending.store(0, Ordering::SeqCst);
        }
    }

    fn add_in_flight(&self, sectors: u64) {
        self.ap_in_flight.fetch_add(sectors, Ordering::SeqCst);
    }

    fn sub_in_flight(&self, sectors: u64) {
        let _ = self
            .ap_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(sectors))
            });
    }

    fn reset_counters(&self) {
        self.ap_pending.store(0, Ordering::SeqCst);
        self.ap_in_flight.store(0, Ordering::SeqCst);
    }

    pub fn queue_work(&self, work: SendWork) -> bool {
        if self.sender.send(work).is_err() {
            trace!("sender queue gone, work dropped");
            return false;
        }
        true
    }

    // Ask the connection tasks to tear the session down. The first
    // reason wins.
    pub fn request_teardown(&self, reason: ConnState) {
        let mut slot = self.teardown_reason.lock().expect("teardown lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.teardown.notify_waiters();
    }

    pub fn teardown_reason(&self) -> Option<ConnState> {
        *self.teardown_reason.lock().expect("teardown lock poisoned")
    }

    pub async fn wait_teardown(&self) -> ConnState {
        loop {
            if let Some(reason) = self.teardown_reason() {
                return reason;
            }
            let notified = self.teardown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.teardown_reason() {
                return reason;
            }
            notified.await;
        }
    }
}

// Everything guarded by the device request lock
pub(crate) struct DeviceInner {
    pub(crate) requests: IndexMap<RequestId, Request>,
    next_id: RequestId,
    pub(crate) tl: TransferLog,
    pub(crate) write_requests: IntervalMap,
    pub(crate) read_requests: IntervalMap,
    pub(crate) epochs: EpochController,
    // Toggle bit for round-robin read balancing
    pub(crate) read_balance_rr: bool,
}

// Follow-up work decided under the request lock, executed after it is
// released. Upper-layer completions are never invoked under the lock.
#[derive(Default)]
pub(crate) struct EventOutcome {
    pub(crate) completions: Vec<(MasterBio, MasterResult)>,
    pub(crate) retries: Vec<RetryWork>,
    pub(crate) resubmits: Vec<LocalSubmit>,
}

pub(crate) struct LocalSubmit {
    pub(crate) id: RequestId,
    pub(crate) kind: IoKind,
    pub(crate) interval: BlockInterval,
    pub(crate) payload: Option<Bytes>,
}

// One replicated volume: the request table, transfer log, interval
// trees and epoch bookkeeping, plus handles to the local disk, the
// out-of-sync bitmap, the activity log and the peer.
pub struct Device {
    name: String,
    role: Mutex<Role>,
    pub(crate) net_conf: NetConfig,
    pub(crate) disk_conf: DiskConfig,
    pub(crate) backing: Arc<dyn BackingStore>,
    pub(crate) bitmap: Arc<dyn SyncBitmap>,
    pub(crate) act_log: Arc<dyn ActivityLog>,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) inner: Mutex<DeviceInner>,
    // Woken whenever a request leaves an interval tree someone waits on
    pub(crate) misc_wait: Notify,
    disk_state: Mutex<DiskState>,
    pub(crate) al_suspended: AtomicBool,
    suspended: AtomicBool,
    resume_notify: Notify,
    pub(crate) peer: RwLock<Option<Arc<PeerDevice>>>,
    // Upper-layer bios admitted and not yet completed
    ap_bio: AtomicU32,
    // References held on the local backing device
    pub(crate) local_cnt: AtomicU32,
    retry_tx: UnboundedSender<RetryWork>,
    retry_rx: Mutex<Option<UnboundedReceiver<RetryWork>>>,
    running: AtomicBool,
    weak_self: Weak<Device>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        role: Role,
        net_conf: NetConfig,
        disk_conf: DiskConfig,
        backing: Arc<dyn BackingStore>,
        bitmap: Arc<dyn SyncBitmap>,
        act_log: Arc<dyn ActivityLog>,
        meta: Arc<MetaStore>,
    ) -> Arc<Self> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| Self {
            name,
            role: Mutex::new(role),
            inner: Mutex::new(DeviceInner {
                requests: IndexMap::new(),
                next_id: 1,
                tl: TransferLog::new(net_conf.tl_size),
                write_requests: IntervalMap::new(),
                read_requests: IntervalMap::new(),
                epochs: EpochController::new(1),
                read_balance_rr: false,
            }),
            net_conf,
            disk_conf,
            backing,
            bitmap,
            act_log,
            meta,
            misc_wait: Notify::new(),
            disk_state: Mutex::new(DiskState::UpToDate),
            al_suspended: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            resume_notify: Notify::new(),
            peer: RwLock::new(None),
            ap_bio: AtomicU32::new(0),
            local_cnt: AtomicU32::new(0),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            running: AtomicBool::new(true),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_role(&self) -> Role {
        *self.role.lock().expect("role lock poisoned")
    }

    pub fn set_role(&self, role: Role) {
        *self.role.lock().expect("role lock poisoned") = role;
        self.meta.set_role(role);
    }

    pub fn get_disk_state(&self) -> DiskState {
        *self.disk_state.lock().expect("disk state lock poisoned")
    }

    pub fn set_disk_state(&self, state: DiskState) {
        *self.disk_state.lock().expect("disk state lock poisoned") = state;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn ap_bio(&self) -> u32 {
        self.ap_bio.load(Ordering::SeqCst)
    }

    pub fn get_peer(&self) -> Option<Arc<PeerDevice>> {
        self.peer.read().expect("peer lock poisoned").clone()
    }

    pub fn attach_peer(&self, peer: Arc<PeerDevice>) {
        *self.peer.write().expect("peer lock poisoned") = Some(peer);
    }

    pub fn detach_peer(&self) {
        *self.peer.write().expect("peer lock poisoned") = None;
    }

    pub(crate) fn inc_ap_bio(&self) {
        self.ap_bio.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ap_bio(&self) {
        self.ap_bio.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn push_retry(&self, work: RetryWork) {
        if self.retry_tx.send(work).is_err() {
            error!("{}: retry queue gone, request dropped", self.name);
        }
    }

    pub(crate) fn take_retry_rx(&self) -> Option<UnboundedReceiver<RetryWork>> {
        self.retry_rx.lock().expect("retry lock poisoned").take()
    }

    pub(crate) async fn wait_resumed(&self) {
        while self.is_suspended() && self.is_running() {
            let notified = self.resume_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_suspended() || !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Request admission and event plumbing
    // ------------------------------------------------------------------

    // Admit a request into the in-flight table. Hands the master bio
    // back when the table is exhausted so the caller can fail the IO.
    pub(crate) fn allocate_request(
        &self,
        inner: &mut DeviceInner,
        kind: IoKind,
        interval: BlockInterval,
        master: MasterBio,
        payload: Option<Bytes>,
    ) -> Result<RequestId, MasterBio> {
        if inner.requests.len() >= self.net_conf.max_requests {
            return Err(master);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let mut req = Request::new(id, kind, interval, master);
        req.payload = payload;
        inner.requests.insert(id, req);
        Ok(id)
    }

    // Apply one event from outside the lock and run the follow-ups
    pub fn req_event(&self, id: RequestId, event: RequestEvent) {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            self.apply_event(&mut inner, id, event, &mut outcome);
        }
        self.finish(outcome);
    }

    // Fire everything that was decided under the lock
    pub(crate) fn finish(&self, outcome: EventOutcome) {
        for (master, result) in outcome.completions {
            counter!("vblock_bio_completed").increment(1u64);
            self.dec_ap_bio();
            master.complete(result);
        }
        for retry in outcome.retries {
            self.push_retry(retry);
        }
        for submit in outcome.resubmits {
            self.spawn_private_bio(submit);
        }
    }

    // Submit the local clone to the backing device; its completion is
    // the endio event. The request may already be gone by the time the
    // IO finishes, so the task identifies it by id only.
    pub(crate) fn spawn_private_bio(&self, submit: LocalSubmit) {
        let backing = Arc::clone(&self.backing);
        let Some(device) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let LocalSubmit {
                id,
                kind,
                interval,
                payload,
            } = submit;
            let result = match kind {
                IoKind::Write => match payload {
                    Some(data) => backing.write(interval.sector, data).await.map(|_| None),
                    None => Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "write without payload",
                    )),
                },
                IoKind::Read | IoKind::ReadAhead => {
                    backing.read(interval.sector, interval.size).await.map(Some)
                }
            };
            device.local_io_complete(id, result);
        });
    }

    // Local disk endio: translate the IO result into the matching event
    pub fn local_io_complete(&self, id: RequestId, result: std::io::Result<Option<Bytes>>) {
        self.local_cnt.fetch_sub(1, Ordering::SeqCst);
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let event = {
                let Some(req) = inner.requests.get_mut(&id) else {
                    warn!("{}: endio for unknown request {}", self.name, id);
                    return;
                };
                match result {
                    Ok(data) => {
                        if let Some(bytes) = data {
                            req.read_data = Some(bytes);
                        }
                        RequestEvent::CompletedOk
                    }
                    Err(e) => {
                        debug!("{}: local IO error on request {}: {}", self.name, id, e);
                        match req.kind {
                            IoKind::Write => RequestEvent::WriteCompletedWithError,
                            IoKind::Read => RequestEvent::ReadCompletedWithError,
                            IoKind::ReadAhead => RequestEvent::ReadAheadCompletedWithError,
                        }
                    }
                }
            };
            self.apply_event(&mut inner, id, event, &mut outcome);
        }
        self.finish(outcome);
    }

    // ------------------------------------------------------------------
    // The centralized event handler. All request state mutation happens
    // here, under the request lock. Having it in one place makes it
    // auditable and forces every "event" in a request's life through
    // the same gate.
    // ------------------------------------------------------------------

    pub(crate) fn apply_event(
        &self,
        inner: &mut DeviceInner,
        id: RequestId,
        event: RequestEvent,
        outcome: &mut EventOutcome,
    ) {
        use RequestEvent::*;

        enum After {
            Nothing,
            MayCompleteNotSusp,
            MayComplete,
            MayDestroy,
        }

        let mut after = After::Nothing;
        let mut close_epoch = false;
        let mut queue: Option<SendWork> = None;
        let mut insert_read_tree = false;
        let mut wakeup_conflicts = false;

        let peer = self.get_peer();

        {
            let max_epoch_size = self.net_conf.max_epoch_size;
            let epoch_full = inner.epochs.current_writes() >= max_epoch_size;
            let Some(req) = inner.requests.get_mut(&id) else {
                warn!("{}: event {:?} for unknown request {}", self.name, event, id);
                return;
            };

            match event {
                ToBeSent => {
                    if req.net.mirrored {
                        error!("{}: request {} bound to the wire twice", self.name, id);
                    }
                    req.net.mirrored = true;
                    req.net.pending = true;
                    let protocol = peer
                        .as_ref()
                        .map(|p| p.protocol())
                        .unwrap_or(self.net_conf.wire_protocol);
                    req.net.expect = if req.is_write() {
                        ExpectedAck::for_protocol(protocol)
                    } else {
                        // reads are answered by a data reply, not an ack
                        ExpectedAck::None
                    };
                    if let Some(peer) = &peer {
                        peer.inc_ap_pending();
                    }
                }

                ToBeSubmitted => {
                    if req.local != LocalFate::Idle {
                        error!("{}: request {} submitted locally twice", self.name, id);
                    }
                    req.local = LocalFate::Pending { aborted: false };
                    self.local_cnt.fetch_add(1, Ordering::SeqCst);
                }

                CompletedOk => {
                    req.local = LocalFate::Completed { ok: true };
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                AbortDiskIo => {
                    if let LocalFate::Pending { .. } = req.local {
                        req.local = LocalFate::Pending { aborted: true };
                    }
                    after = After::MayCompleteNotSusp;
                }

                WriteCompletedWithError => {
                    req.local = LocalFate::Completed { ok: false };
                    req.local_error = Some(IoStatus::Io);
                    self.escalate_disk_error();
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                ReadAheadCompletedWithError => {
                    // it is legal to fail readahead, no escalation
                    req.local = LocalFate::Completed { ok: false };
                    req.local_error = Some(IoStatus::Io);
                    after = After::MayCompleteNotSusp;
                }

                ReadCompletedWithError => {
                    // the peer owning the good copy must redo this range
                    self.bitmap.set_out_of_sync(&req.interval);
                    req.local = LocalFate::Completed { ok: false };
                    req.local_error = Some(IoStatus::Io);
                    self.escalate_disk_error();
                    after = After::MayCompleteNotSusp;
                }

                QueueForNetRead => {
                    insert_read_tree = true;
                    req.net.phase = NetPhase::Queued;
                    queue = Some(SendWork::ReadRequest(id));
                }

                QueueForNetWrite => {
                    req.net.phase = NetPhase::Queued;
                    queue = Some(SendWork::Data(id));
                    // close the epoch in case it outgrew the limit
                    if epoch_full {
                        close_epoch = true;
                    }
                }

                QueueForSendOos => {
                    req.net.phase = NetPhase::Queued;
                    queue = Some(SendWork::Oos(id));
                }

                ReadRetryRemoteCanceled | SendCanceled | SendFailed => {
                    // real cleanup is done by tl_clear; just drop the
                    // queue membership
                    if req.net.phase == NetPhase::Queued {
                        req.net.phase = NetPhase::Idle;
                    }
                    after = After::MayCompleteNotSusp;
                }

                HandedOverToNetwork => {
                    if req.is_write() {
                        if let Some(peer) = &peer {
                            peer.add_in_flight(req.interval.sectors());
                        }
                    }
                    if req.is_write() && req.net.expect == ExpectedAck::None {
                        // this is what is dangerous about protocol A:
                        // pretend it was successfully written on the peer
                        if req.net.pending {
                            if let Some(peer) = &peer {
                                peer.dec_ap_pending();
                            }
                            req.net.pending = false;
                            req.net.ok = true;
                        }
                        // still not done until the barrier ack, so we
                        // know what to dirty on connection loss
                    }
                    if req.net.phase != NetPhase::Done {
                        req.net.phase = NetPhase::Sent;
                    }
                    after = After::MayCompleteNotSusp;
                }

                OosHandedToNetwork => {
                    // was never pending, no longer queued, so now done
                    // as far as this connection is concerned
                    req.net.set_done();
                    after = After::MayCompleteNotSusp;
                }

                ConnectionLostWhilePending => {
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                        }
                    }
                    if req.net.phase == NetPhase::Sent && req.is_write() {
                        if let Some(peer) = &peer {
                            peer.sub_in_flight(req.interval.sectors());
                        }
                    }
                    req.net.pending = false;
                    req.net.ok = false;
                    req.net.set_done();
                    after = After::MayComplete;
                }

                DiscardWrite => {
                    // dropped by the peer due to a conflict: settled,
                    // but not a success
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                            peer.sub_in_flight(req.interval.sectors());
                        }
                        req.net.pending = false;
                    }
                    req.net.set_done();
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                WriteAckedByPeer | WriteAckedByPeerAndSis => {
                    if req.net.expect != ExpectedAck::Write {
                        error!("{}: unexpected write ack for request {}", self.name, id);
                    }
                    if event == WriteAckedByPeerAndSis {
                        req.net.sis = true;
                    }
                    req.net.ok = true;
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                            peer.sub_in_flight(req.interval.sectors());
                        }
                        req.net.pending = false;
                    }
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                RecvAckedByPeer => {
                    if req.net.expect != ExpectedAck::Receive {
                        error!("{}: unexpected receive ack for request {}", self.name, id);
                    }
                    req.net.ok = true;
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                            peer.sub_in_flight(req.interval.sectors());
                        }
                        req.net.pending = false;
                    }
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                PostponeWrite => {
                    if req.net.expect != ExpectedAck::Write {
                        error!("{}: postpone for non-protocol-C request {}", self.name, id);
                    }
                    // the peer will never ack this attempt; the request
                    // goes back through the router, where the conflict
                    // wait serializes it against our own write
                    req.postponed = true;
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                            peer.sub_in_flight(req.interval.sectors());
                        }
                        req.net.pending = false;
                    }
                    req.net.set_done();
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                NegAcked => {
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                            if req.is_write() {
                                peer.sub_in_flight(req.interval.sectors());
                            }
                        }
                    }
                    req.net.pending = false;
                    req.net.ok = false;
                    req.net.set_done();
                    wakeup_conflicts = true;
                    after = After::MayCompleteNotSusp;
                }

                BarrierAcked => {
                    if req.is_write() {
                        if req.net.pending {
                            // barrier overtook its acks: cleanup after a
                            // later connection loss would miss this one
                            error!("{}: barrier acked but request {} pending", self.name, id);
                        }
                        if req.net.mirrored || req.net.phase != NetPhase::Idle {
                            if req.net.expect == ExpectedAck::None {
                                if let Some(peer) = &peer {
                                    peer.sub_in_flight(req.interval.sectors());
                                }
                            }
                            req.net.set_done();
                            req.barrier_acked = true;
                        }
                        after = After::MayDestroy;
                    }
                }

                DataReceived => {
                    if req.net.pending {
                        if let Some(peer) = &peer {
                            peer.dec_ap_pending();
                        }
                        req.net.pending = false;
                    } else {
                        warn!("{}: data reply for settled request {}", self.name, id);
                    }
                    req.net.ok = true;
                    req.net.set_done();
                    after = After::MayCompleteNotSusp;
                }

                Resend => {
                    if !req.net.ok {
                        // back on the wire it goes
                        if !req.net.pending {
                            req.net.pending = true;
                            if let Some(peer) = &peer {
                                peer.inc_ap_pending();
                            }
                        }
                        req.net.phase = NetPhase::Queued;
                        queue = Some(if req.is_write() {
                            SendWork::Data(id)
                        } else {
                            SendWork::ReadRequest(id)
                        });
                    } else if req.is_write() {
                        // acked before the connection loss, only the
                        // barrier ack was missing: pretend we got it
                        req.net.set_done();
                        req.barrier_acked = true;
                        after = After::MayDestroy;
                    }
                }

                RestartFrozenDiskIo => {
                    if let LocalFate::Completed { .. } = req.local {
                        req.local = LocalFate::Pending { aborted: false };
                        req.local_error = None;
                        self.local_cnt.fetch_add(1, Ordering::SeqCst);
                        outcome.resubmits.push(LocalSubmit {
                            id,
                            kind: req.kind,
                            interval: req.interval,
                            payload: req.payload.clone(),
                        });
                    }
                }

                FailFrozenDiskIo => {
                    if let LocalFate::Completed { .. } = req.local {
                        after = After::MayComplete;
                    }
                }
            }
        }

        if insert_read_tree {
            let interval = inner.requests[&id].interval;
            inner.read_requests.insert(id, interval);
            if let Some(req) = inner.requests.get_mut(&id) {
                req.in_read_tree = true;
            }
        }

        if wakeup_conflicts {
            self.maybe_wakeup_conflicting(inner, id);
        }

        if let Some(work) = queue {
            let queued = peer.as_ref().map(|p| p.queue_work(work)).unwrap_or(false);
            if !queued {
                // no connection: undo the queue membership right away
                if let Some(req) = inner.requests.get_mut(&id) {
                    req.net.phase = NetPhase::Idle;
                }
            }
        }

        if close_epoch {
            self.close_epoch(inner);
        }

        match after {
            After::Nothing => {}
            After::MayCompleteNotSusp => {
                if !self.is_suspended() {
                    self.req_may_be_completed(inner, id, outcome);
                }
            }
            After::MayComplete => self.req_may_be_completed(inner, id, outcome),
            After::MayDestroy => self.req_may_be_done(inner, id, outcome),
        }
    }

    // Retry all conflicting requests once this one can no longer block
    // them
    fn maybe_wakeup_conflicting(&self, inner: &DeviceInner, id: RequestId) {
        let Some(req) = inner.requests.get(&id) else {
            return;
        };
        if req.local.blocks_completion() {
            return;
        }
        if req.in_write_tree || req.in_read_tree {
            self.misc_wait.notify_waiters();
        }
    }

    // Close the current epoch: append its barrier marker to the log;
    // the sender emits the frame before the next epoch's first write
    pub(crate) fn close_epoch(&self, inner: &mut DeviceInner) {
        let barrier_nr = inner.epochs.close();
        inner.tl.append_barrier(barrier_nr);
        trace!("{}: epoch {} closed", self.name, barrier_nr);
    }

    fn escalate_disk_error(&self) {
        match self.disk_conf.on_io_error {
            OnIoError::PassOn => {}
            OnIoError::Detach => {
                let mut disk = self.disk_state.lock().expect("disk state lock poisoned");
                if *disk > DiskState::Failed {
                    error!("{}: local disk error, detaching", self.name);
                    *disk = DiskState::Failed;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion and destruction
    // ------------------------------------------------------------------

    // Set up the master completion if the request is fit for it: local
    // part settled, not on a sender queue, no ack outstanding
    pub(crate) fn req_may_be_completed(
        &self,
        inner: &mut DeviceInner,
        id: RequestId,
        outcome: &mut EventOutcome,
    ) {
        let Some(req) = inner.requests.get(&id) else {
            return;
        };
        if req.local.blocks_completion() {
            return;
        }
        if req.net.phase == NetPhase::Queued {
            return;
        }
        if req.net.pending {
            return;
        }

        if req.master.is_some() {
            let interval = req.interval;
            let is_write = req.is_write();
            let epoch_nr = req.epoch_nr;
            let in_tl = req.in_tl;
            let kind = req.kind;
            // report success when at least one of the operations
            // succeeded; only report failure when both failed
            let ok = req.local.is_ok() || req.net.ok;

            self.remove_from_trees(inner, id, &interval);

            // before signalling completion upwards, fence this write
            // from the next epoch
            if is_write && epoch_nr == inner.epochs.current_nr() {
                self.close_epoch(inner);
            }

            let req = inner
                .requests
                .get_mut(&id)
                .expect("request vanished under lock");

            // a failed READ re-enters the router to find a better path,
            // unless it never made it into the log; readahead is not
            // retried
            if !ok && kind == IoKind::Read && in_tl {
                req.postponed = true;
            }

            if !req.postponed {
                let result = if ok {
                    Ok(req.read_data.take())
                } else {
                    Err(req.local_error.unwrap_or(IoStatus::Io))
                };
                let master = req.master.take().expect("master checked above");
                outcome.completions.push((master, result));
            }
        }

        self.req_may_be_done(inner, id, outcome);
    }

    // Reclaim the request if nobody can reference it anymore
    pub(crate) fn req_may_be_done(
        &self,
        inner: &mut DeviceInner,
        id: RequestId,
        outcome: &mut EventOutcome,
    ) {
        let Some(req) = inner.requests.get(&id) else {
            return;
        };
        if req.master.is_some() && !req.postponed {
            return;
        }
        // may happen for aborted local IO: completed upwards while the
        // memory is still owned by the backing device
        if req.local.is_pending() {
            return;
        }
        if req.net.phase == NetPhase::Queued {
            return;
        }
        if req.net.mirrored && !req.net.is_done() {
            // network part still waiting for its barrier ack
            return;
        }
        self.destroy_request(inner, id, outcome);
    }

    fn remove_from_trees(&self, inner: &mut DeviceInner, id: RequestId, interval: &BlockInterval) {
        let (in_w, in_r) = match inner.requests.get(&id) {
            Some(req) => (req.in_write_tree, req.in_read_tree),
            None => return,
        };
        let mut woke = false;
        if in_w && inner.write_requests.remove(id, interval) {
            woke = true;
        }
        if in_r && inner.read_requests.remove(id, interval) {
            woke = true;
        }
        if let Some(req) = inner.requests.get_mut(&id) {
            req.in_write_tree = false;
            req.in_read_tree = false;
        }
        if woke {
            self.misc_wait.notify_waiters();
        }
    }

    fn destroy_request(&self, inner: &mut DeviceInner, id: RequestId, outcome: &mut EventOutcome) {
        let interval = match inner.requests.get(&id) {
            Some(req) => req.interval,
            None => return,
        };
        self.remove_from_trees(inner, id, &interval);

        let Some(mut req) = inner.requests.swap_remove(&id) else {
            return;
        };

        if req.in_tl {
            if req.counts_for_barrier() && !req.barrier_acked {
                // keep the epoch set-size accounting exact
                inner.tl.tombstone_request(id, req.epoch_nr);
            } else {
                inner.tl.remove_request(id);
            }
        }

        if req.is_write() {
            // set out-of-sync unless both sides are known good
            if !(req.net.ok && req.local.is_ok()) {
                self.bitmap.set_out_of_sync(&req.interval);
            } else if req.net.sis {
                self.bitmap.set_in_sync(&req.interval);
            }

            // the extent may only leave the activity log once the peer
            // knows about the write; dropping it earlier would skip the
            // resync of this range after a crash
            if req.in_act_log {
                self.act_log.complete_io(&req.interval);
            }
        }

        if req.postponed {
            match req.master.take() {
                Some(master) => {
                    // admission accounting restarts when the retry
                    // worker re-enters the router
                    self.dec_ap_bio();
                    outcome.retries.push(RetryWork {
                        kind: req.kind,
                        interval: req.interval,
                        payload: req.payload.take(),
                        master,
                    });
                }
                None => error!("{}: postponed request {} lost its master bio", self.name, id),
            }
        }
        counter!("vblock_requests_destroyed").increment(1u64);
    }

    // ------------------------------------------------------------------
    // Barrier acks and connection loss
    // ------------------------------------------------------------------

    // The peer durably stored every write of the epoch closed by this
    // barrier. A mismatch in barrier number or set size means the local
    // and peer views of the log diverged, which is fatal for the
    // session.
    pub fn barrier_ack(&self, barrier_nr: u32, set_size: u32) -> Result<(), TlError> {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let entries = match inner.tl.entries_before_barrier(barrier_nr) {
                Ok(entries) => entries,
                Err(e) => {
                    error!("{}: {}", self.name, e);
                    return Err(e);
                }
            };

            let mut counted = 0u32;
            let mut acked = Vec::new();
            for entry in entries {
                match entry {
                    TlEntry::Request(req_id) => {
                        let Some(req) = inner.requests.get(&req_id) else {
                            continue;
                        };
                        if req.counts_for_barrier() && req.epoch_nr == barrier_nr {
                            counted += 1;
                            acked.push(req_id);
                        }
                    }
                    TlEntry::Completed { epoch_nr } if epoch_nr == barrier_nr => {
                        counted += 1;
                    }
                    _ => {}
                }
            }

            if counted != set_size {
                let e = TlError::SetSizeMismatch {
                    found: counted,
                    reported: set_size,
                };
                error!("{}: {}", self.name, e);
                return Err(e);
            }

            for req_id in acked {
                self.apply_event(&mut inner, req_id, RequestEvent::BarrierAcked, &mut outcome);
            }
            inner.tl.retire_barrier(barrier_nr);
        }
        self.finish(outcome);
        Ok(())
    }

    // The connection died. Walk the transfer log and either prepare
    // every un-acked write for replay, or fail the network part of
    // everything in flight. Either way the next resync must redo the
    // covered ranges.
    pub fn tl_clear(&self, mode: ClearMode) {
        debug!("{}: tl_clear {:?}", self.name, mode);
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let ids: Vec<RequestId> = inner.tl.request_ids().collect();

            for id in ids {
                let Some((interval, counts, done, phase)) = inner
                    .requests
                    .get(&id)
                    .map(|r| (r.interval, r.counts_for_barrier(), r.net.is_done(), r.net.phase))
                else {
                    continue;
                };

                // the data may or may not be on the peer; treat it as
                // not there until a resync settles it
                if counts && !done {
                    self.bitmap.set_out_of_sync(&interval);
                }

                match mode {
                    ClearMode::Fail => {
                        if phase == NetPhase::Queued {
                            self.apply_event(
                                &mut inner,
                                id,
                                RequestEvent::SendCanceled,
                                &mut outcome,
                            );
                        }
                        let still_networked = inner
                            .requests
                            .get(&id)
                            .map(|r| r.net.mirrored && !r.net.is_done())
                            .unwrap_or(false);
                        if still_networked {
                            self.apply_event(
                                &mut inner,
                                id,
                                RequestEvent::ConnectionLostWhilePending,
                                &mut outcome,
                            );
                        }
                    }
                    ClearMode::Resend => {
                        // drop the wire phase; resend_all re-queues on
                        // the next connection
                        if let Some(req) = inner.requests.get_mut(&id) {
                            if !req.net.ok && req.net.phase != NetPhase::Idle {
                                req.net.phase = NetPhase::Idle;
                            }
                        }
                    }
                }
            }

            match mode {
                ClearMode::Fail => {
                    // everything settled; the barrier bookkeeping is
                    // void
                    inner.epochs.drop_pending_barriers();
                    inner.tl.drop_barrier_state();
                }
                ClearMode::Resend => {
                    // destroyed writes will not be re-counted by the
                    // peer, but every un-acked barrier must be fenced
                    // again around the replayed writes
                    inner.tl.drop_tombstones();
                    let barriers = inner.tl.barrier_numbers();
                    inner.epochs.restore_pending_barriers(barriers);
                }
            }
        }
        if let Some(peer) = self.get_peer() {
            peer.reset_counters();
        }
        self.finish(outcome);
    }

    // Reconnect happened and the peer provably did not restart: put
    // every request that still lacks positive evidence back on the wire
    pub fn resend_all(&self) {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let ids: Vec<RequestId> = inner.tl.request_ids().collect();
            for id in ids {
                let mirrored = inner
                    .requests
                    .get(&id)
                    .map(|r| r.net.mirrored)
                    .unwrap_or(false);
                if mirrored {
                    self.apply_event(&mut inner, id, RequestEvent::Resend, &mut outcome);
                }
            }
        }
        self.finish(outcome);
    }

    // Oldest request the watchdog should measure, with its pending axes
    pub(crate) fn oldest_pending(&self) -> Option<(std::time::Instant, bool, bool)> {
        let inner = self.inner.lock().expect("req lock poisoned");
        for id in inner.tl.request_ids() {
            if let Some(req) = inner.requests.get(&id) {
                let net_pending = req.net.pending;
                let local_pending = req.local.is_pending();
                if net_pending || local_pending {
                    return Some((req.submit_time, net_pending, local_pending));
                }
            }
        }
        None
    }

    // Any in-flight local write overlapping the range? Consulted by the
    // receive side before applying a mirrored write.
    pub fn has_conflicting_write(&self, interval: &BlockInterval) -> bool {
        let inner = self.inner.lock().expect("req lock poisoned");
        inner.write_requests.find_overlap(interval).is_some()
    }

    // Snapshot what the sender needs to put a request on the wire.
    // None when the request is gone or no longer queued (canceled while
    // the work item sat in the channel).
    pub fn read_for_send(
        &self,
        id: RequestId,
    ) -> Option<(BlockInterval, u32, Option<Bytes>)> {
        let inner = self.inner.lock().expect("req lock poisoned");
        let req = inner.requests.get(&id)?;
        if req.net.phase != NetPhase::Queued {
            return None;
        }
        Some((req.interval, req.epoch_nr, req.payload.clone()))
    }

    // Barriers that must be emitted before a write of the given epoch
    pub fn barriers_due_before(&self, epoch_nr: u32) -> Vec<u32> {
        let mut inner = self.inner.lock().expect("req lock poisoned");
        inner.epochs.barriers_due_before(epoch_nr)
    }

    // Administrative abort of everything the backing device still owns
    // (device detach). The memory stays with the disk until its endio
    // fires; completions to the upper layer may happen earlier.
    pub fn abort_disk_io(&self) {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let ids: Vec<RequestId> = inner
                .requests
                .iter()
                .filter(|(_, r)| r.local.is_pending())
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.apply_event(&mut inner, id, RequestEvent::AbortDiskIo, &mut outcome);
            }
        }
        self.finish(outcome);
    }

    // The backing device came back after a freeze: re-submit every
    // locally completed request
    pub fn restart_frozen_io(&self) {
        self.for_each_frozen(RequestEvent::RestartFrozenDiskIo);
    }

    // Give up on frozen local IO: complete upwards with whatever is
    // known
    pub fn fail_frozen_io(&self) {
        self.for_each_frozen(RequestEvent::FailFrozenDiskIo);
    }

    fn for_each_frozen(&self, event: RequestEvent) {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            let ids: Vec<RequestId> = inner
                .requests
                .iter()
                .filter(|(_, r)| matches!(r.local, LocalFate::Completed { .. }))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.apply_event(&mut inner, id, event, &mut outcome);
            }
        }
        self.finish(outcome);
    }

    pub fn set_al_suspended(&self, value: bool) {
        self.al_suspended.store(value, Ordering::SeqCst);
    }

    // A read answer arrived from the peer
    pub fn data_received(&self, id: RequestId, data: Bytes) {
        let mut outcome = EventOutcome::default();
        {
            let mut inner = self.inner.lock().expect("req lock poisoned");
            if let Some(req) = inner.requests.get_mut(&id) {
                req.read_data = Some(data);
            }
            self.apply_event(&mut inner, id, RequestEvent::DataReceived, &mut outcome);
        }
        self.finish(outcome);
    }
}

// Registry of configured devices, replacing any global per-minor table.
// Devices are created during configuration and dropped at teardown;
// every operation takes its device handle explicitly.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Arc<Device>) {
        self.devices.insert(device.name().to_string(), device);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.remove(name).map(|(_, device)| device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backing::MemBacking;
    use crate::core::bitmap::{MemActivityLog, MemBitmap};

    pub(crate) fn test_device(protocol: WireProtocol) -> (Arc<Device>, UnboundedReceiver<SendWork>) {
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
            Arc::new(MetaStore::load_or_init("/nonexistent/test.meta", Role::Primary)),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(PeerDevice::new(protocol, true, tx));
        device.attach_peer(peer);
        (device, rx)
    }

    fn admit_write(device: &Device, sector: u64, size: u32) -> (RequestId, tokio::sync::oneshot::Receiver<MasterResult>) {
        let (master, rx) = MasterBio::new();
        let mut inner = device.inner.lock().unwrap();
        let id = device
            .allocate_request(
                &mut inner,
                IoKind::Write,
                BlockInterval::new(sector, size),
                master,
                Some(Bytes::from(vec![0u8; size as usize])),
            )
            .unwrap();
        let epoch = inner.epochs.stamp_write();
        inner.requests.get_mut(&id).unwrap().epoch_nr = epoch;
        inner.tl.append_request(id).unwrap();
        inner.requests.get_mut(&id).unwrap().in_tl = true;
        drop(inner);
        device.inc_ap_bio();
        (id, rx)
    }

    #[tokio::test]
    async fn test_protocol_c_write_lifecycle() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, mut rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.local_io_complete(id, Ok(None));

        // protocol C: no completion before the write ack
        assert!(rx.try_recv().is_err());

        device.req_event(id, RequestEvent::WriteAckedByPeer);
        let result = rx.await.unwrap();
        assert!(result.is_ok());

        // destroyed only once the barrier ack arrives
        {
            let inner = device.inner.lock().unwrap();
            assert!(inner.requests.contains_key(&id));
        }
        device.barrier_ack(1, 1).unwrap();
        let inner = device.inner.lock().unwrap();
        assert!(!inner.requests.contains_key(&id));
    }

    #[tokio::test]
    async fn test_protocol_a_optimism() {
        let (device, _work) = test_device(WireProtocol::A);
        let (id, mut rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.local_io_complete(id, Ok(None));
        assert!(rx.try_recv().is_err());

        // hand-over alone completes the master bio under protocol A
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_neg_ack_local_success_wins() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, rx) = admit_write(&device, 8, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.local_io_complete(id, Ok(None));
        device.req_event(id, RequestEvent::NegAcked);

        // local copy is good: the upper layer sees success
        assert!(rx.await.unwrap().is_ok());

        // and the range is out of sync for the peer
        assert!(device.bitmap.count_bits_in(&BlockInterval::new(8, 4096)) > 0);
    }

    #[tokio::test]
    async fn test_barrier_ack_set_size_mismatch_is_fatal() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, _rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        {
            let mut inner = device.inner.lock().unwrap();
            device.close_epoch(&mut inner);
        }

        assert!(matches!(
            device.barrier_ack(1, 5),
            Err(TlError::SetSizeMismatch { found: 1, reported: 5 })
        ));
    }

    #[tokio::test]
    async fn test_barrier_number_mismatch_is_fatal() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, _rx) = admit_write(&device, 0, 4096);
        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        {
            let mut inner = device.inner.lock().unwrap();
            device.close_epoch(&mut inner);
        }
        assert!(matches!(
            device.barrier_ack(9, 1),
            Err(TlError::BarrierMismatch { found: 1, reported: 9 })
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_marks_out_of_sync_and_keeps_for_resend() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, mut rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.local_io_complete(id, Ok(None));

        device.tl_clear(ClearMode::Resend);

        // range dirty, no completion yet, request still replayable
        assert!(device.bitmap.count_bits_in(&BlockInterval::new(0, 4096)) > 0);
        assert!(rx.try_recv().is_err());
        let inner = device.inner.lock().unwrap();
        let req = inner.requests.get(&id).unwrap();
        assert!(req.net.pending);
        assert_eq!(req.net.phase, NetPhase::Idle);
    }

    #[tokio::test]
    async fn test_resend_requeues_unacked_write() {
        let (device, mut work) = test_device(WireProtocol::C);
        let (id, _rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        // drain the original queue entry
        assert!(matches!(work.try_recv(), Ok(SendWork::Data(_))));

        device.tl_clear(ClearMode::Resend);
        device.resend_all();

        assert!(matches!(work.try_recv(), Ok(SendWork::Data(got)) if got == id));
    }

    #[tokio::test]
    async fn test_resend_refences_closed_epochs() {
        let (device, mut work) = test_device(WireProtocol::C);

        // epoch 1 write, epoch closed, epoch 2 write; none acked
        let (id1, _rx1) = admit_write(&device, 0, 4096);
        device.req_event(id1, RequestEvent::ToBeSent);
        device.req_event(id1, RequestEvent::QueueForNetWrite);
        device.req_event(id1, RequestEvent::HandedOverToNetwork);
        {
            let mut inner = device.inner.lock().unwrap();
            device.close_epoch(&mut inner);
        }
        let (id2, _rx2) = admit_write(&device, 64, 4096);
        device.req_event(id2, RequestEvent::ToBeSent);
        device.req_event(id2, RequestEvent::QueueForNetWrite);
        device.req_event(id2, RequestEvent::HandedOverToNetwork);
        while work.try_recv().is_ok() {}

        device.tl_clear(ClearMode::Resend);
        device.resend_all();

        // replay order is submission order
        assert!(matches!(work.try_recv(), Ok(SendWork::Data(got)) if got == id1));
        assert!(matches!(work.try_recv(), Ok(SendWork::Data(got)) if got == id2));

        // barrier 1 must be re-fenced before the epoch-2 write goes out
        assert_eq!(device.barriers_due_before(2), vec![1]);

        // and the replayed epoch still audits correctly
        device.req_event(id1, RequestEvent::WriteAckedByPeer);
        device.barrier_ack(1, 1).unwrap();
        let inner = device.inner.lock().unwrap();
        assert!(!inner.requests.contains_key(&id1));
        assert!(inner.requests.contains_key(&id2));
    }

    #[tokio::test]
    async fn test_connection_loss_fail_mode_completes_with_local_result() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.local_io_complete(id, Ok(None));

        device.tl_clear(ClearMode::Fail);

        // network failed but the local write landed: success upwards
        assert!(rx.await.unwrap().is_ok());
        let inner = device.inner.lock().unwrap();
        assert!(!inner.requests.contains_key(&id));
    }

    #[tokio::test]
    async fn test_discard_write_not_counted_as_success() {
        let (device, _work) = test_device(WireProtocol::C);
        let (id, rx) = admit_write(&device, 0, 4096);

        device.req_event(id, RequestEvent::ToBeSent);
        device.req_event(id, RequestEvent::QueueForNetWrite);
        device.req_event(id, RequestEvent::ToBeSubmitted);
        device.req_event(id, RequestEvent::HandedOverToNetwork);
        device.local_io_complete(id, Ok(None));
        device.req_event(id, RequestEvent::DiscardWrite);

        // settled by the discard, carried by the local copy
        assert!(rx.await.unwrap().is_ok());
    }
}
