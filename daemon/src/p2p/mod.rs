pub mod ack_receiver;
pub mod connection;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::config::{BM_BLOCK_SIZE, PROTOCOL_VERSION, RECONNECT_DELAY_SECS};
use crate::core::device::{ClearMode, Device, PeerDevice};
use crate::core::metadata::{GenIdx, GEN_CNT_SIZE};
use crate::core::state::{ConnState, ReplState, Role};

use self::connection::Connection;
use self::error::{P2pError, P2pResult};
use self::packet::{read_frame, CStatePacket, Packet, ReportParams};

// How long the accepting side waits for the second (meta) socket
const MSOCK_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

// How long to wait for the peer's parameter packet
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Replication link lifecycle for one device: connect or accept the
// two-socket pair, run the handshake, spawn the sender/receiver/ack
// tasks, and reconnect after failures. The data socket is always
// established first, the meta socket second.
pub struct PeerLink {
    device: Arc<Device>,
    listen_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    running: AtomicBool,
    // generation counters the peer reported last session, with the
    // connected counter masked out; unchanged counters mean the peer
    // did not restart in between
    last_peer_gen: Mutex<Option<[u32; GEN_CNT_SIZE]>>,
    // the last disconnect kept replayable request state
    resumable: AtomicBool,
}

// The connected counter advances on every handshake, so it cannot be
// part of the restart check
fn incarnation_of(gen_cnt: &[u32; GEN_CNT_SIZE]) -> [u32; GEN_CNT_SIZE] {
    let mut masked = *gen_cnt;
    masked[GenIdx::ConnectedCnt as usize] = 0;
    masked
}

impl PeerLink {
    pub fn new(
        device: Arc<Device>,
        listen_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            listen_addr,
            peer_addr,
            running: AtomicBool::new(false),
            last_peer_gen: Mutex::new(None),
            resumable: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // Run the connect/serve/reconnect loop until stopped
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("{}: peer link already running", self.device.name());
            return;
        }

        let listener = match self.listen_addr {
            Some(addr) => match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!("{}: listening on {}", self.device.name(), addr);
                    Some(listener)
                }
                Err(e) => {
                    error!("{}: cannot bind {}: {}", self.device.name(), addr, e);
                    return;
                }
            },
            None => None,
        };

        while self.is_running() && self.device.is_running() {
            let session = match (&listener, self.peer_addr) {
                (_, Some(addr)) => self.connect_pair(addr).await,
                (Some(listener), None) => self.accept_pair(listener).await,
                (None, None) => {
                    error!("{}: neither listen nor peer address", self.device.name());
                    return;
                }
            };

            match session {
                Ok((data, meta, outgoing)) => {
                    match self.run_session(data, meta, outgoing).await {
                        Ok(reason) => {
                            info!("{}: session ended: {}", self.device.name(), reason)
                        }
                        Err(e) => warn!("{}: session failed: {}", self.device.name(), e),
                    }
                    // dispose of whatever was in flight: replay later
                    // if IO is frozen, fail over to the local copy
                    // otherwise
                    let mode = if self.device.is_suspended() {
                        ClearMode::Resend
                    } else {
                        ClearMode::Fail
                    };
                    self.resumable
                        .store(mode == ClearMode::Resend, Ordering::SeqCst);
                    self.device.tl_clear(mode);
                    self.device.detach_peer();
                }
                Err(e) => {
                    debug!("{}: connect failed: {}", self.device.name(), e);
                }
            }

            if self.is_running() {
                sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }

    async fn connect_pair(&self, addr: SocketAddr) -> P2pResult<(TcpStream, TcpStream, bool)> {
        let data = TcpStream::connect(addr).await?;
        let meta = TcpStream::connect(addr).await?;
        Ok((data, meta, true))
    }

    async fn accept_pair(&self, listener: &TcpListener) -> P2pResult<(TcpStream, TcpStream, bool)> {
        let (data, data_addr) = listener.accept().await?;
        let (meta, meta_addr) = match timeout(MSOCK_ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(accepted) => accepted?,
            Err(_) => {
                return Err(P2pError::InvalidHandshake(
                    "peer never opened the meta socket".to_string(),
                ))
            }
        };
        if data_addr.ip() != meta_addr.ip() {
            return Err(P2pError::InvalidHandshake(format!(
                "socket pair from different peers: {} and {}",
                data_addr, meta_addr
            )));
        }
        Ok((data, meta, false))
    }

    async fn run_session(
        &self,
        data: TcpStream,
        meta: TcpStream,
        outgoing: bool,
    ) -> P2pResult<ConnState> {
        let device = &self.device;
        let (connection, mut data_in, meta_in) = Connection::new(
            data,
            meta,
            outgoing,
            device.net_conf.send_timeout(),
        );
        let connection = Arc::new(connection);

        // the first packet on a fresh connection is ReportParams, in
        // both directions
        let ours = ReportParams {
            device_size: device.backing.capacity_bytes(),
            block_size: BM_BLOCK_SIZE,
            state: device.get_role().to_wire(),
            protocol: device.net_conf.wire_protocol.to_wire(),
            version: PROTOCOL_VERSION,
            gen_cnt: device.meta.gen_cnt(),
        };
        connection
            .send_data(Packet::ReportParams(ours.clone()).to_frame())
            .await?;
        let first = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut data_in)).await {
            Ok(frame) => frame?,
            Err(_) => {
                return Err(P2pError::InvalidHandshake(
                    "peer never sent its parameters".to_string(),
                ))
            }
        };
        let theirs = match first {
            Packet::ReportParams(params) => params,
            other => {
                return Err(P2pError::InvalidHandshake(format!(
                    "expected ReportParams, got {:#06x}",
                    other.command()
                )))
            }
        };

        if theirs.version != PROTOCOL_VERSION {
            return Err(P2pError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: theirs.version,
            });
        }
        if theirs.protocol != ours.protocol {
            return Err(P2pError::ProtocolMismatch {
                ours: ours.protocol,
                theirs: theirs.protocol,
            });
        }
        if theirs.device_size != ours.device_size {
            warn!(
                "{}: peer device size {} differs from ours {}",
                device.name(),
                theirs.device_size,
                ours.device_size
            );
        }
        if Role::from_wire(theirs.state).is_none() {
            return Err(P2pError::InvalidHandshake(format!(
                "bad peer state {}",
                theirs.state
            )));
        }

        // the generation counters decide who has the good data and
        // whether the bitmap still describes the divergence
        let have_good = device.meta.compare(&theirs.gen_cnt);
        match have_good {
            std::cmp::Ordering::Greater => {
                info!("{}: local generation is ahead", device.name())
            }
            std::cmp::Ordering::Less => info!("{}: peer has the good data", device.name()),
            std::cmp::Ordering::Equal => debug!("{}: generations equal", device.name()),
        }
        let quick_ok = device
            .meta
            .quick_sync_ok(&theirs.gen_cnt, have_good.is_gt());
        if !quick_ok && have_good.is_gt() {
            warn!("{}: full resync required", device.name());
            device.bitmap.set_all_out_of_sync();
        }

        // replay is only safe when the peer provably kept its state
        let peer_incarnation = incarnation_of(&theirs.gen_cnt);
        let can_resend = self.resumable.load(Ordering::SeqCst)
            && *self.last_peer_gen.lock().expect("peer gen lock poisoned")
                == Some(peer_incarnation);
        *self.last_peer_gen.lock().expect("peer gen lock poisoned") = Some(peer_incarnation);
        if !can_resend {
            // leftover replayable state cannot be replayed after all
            self.device.tl_clear(ClearMode::Fail);
        }

        // every state transition persists the counters
        device.meta.inc(GenIdx::ConnectedCnt);
        if let Err(e) = device.meta.store().await {
            error!("{}: cannot persist superblock: {}", device.name(), e);
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (meta_tx, meta_rx) = mpsc::unbounded_channel();

        let peer = Arc::new(PeerDevice::new(
            device.net_conf.wire_protocol,
            outgoing,
            work_tx,
        ));
        peer.set_repl_state(ReplState::Established);
        device.attach_peer(Arc::clone(&peer));
        connection.set_state(ConnState::Connected);
        info!("{}: {}", device.name(), connection);

        let _ = meta_tx.send(Packet::CStateChanged(CStatePacket {
            cstate: ConnState::Connected.to_wire(),
        }));

        let handles = vec![
            sender::spawn_sender(
                Arc::clone(device),
                Arc::clone(&peer),
                Arc::clone(&connection),
                work_rx,
            ),
            ack_receiver::spawn_ack_receiver(
                Arc::clone(device),
                Arc::clone(&peer),
                Arc::clone(&connection),
                meta_in,
            ),
            ack_receiver::spawn_meta_writer(
                Arc::clone(device),
                Arc::clone(&peer),
                Arc::clone(&connection),
                meta_rx,
            ),
            receiver::spawn_receiver(
                Arc::clone(device),
                Arc::clone(&peer),
                data_in,
                meta_tx.clone(),
            ),
        ];

        if can_resend {
            info!("{}: replaying in-flight requests", device.name());
            device.resend_all();
        }

        // the session lives until someone declares it dead
        let reason = peer.wait_teardown().await;
        connection.set_state(reason);
        connection.shutdown().await;
        for handle in handles {
            handle.abort();
        }
        Ok(reason)
    }
}
