use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{error, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use vblock_common::time::get_current_time_in_millis;

use crate::config::{INITIAL_ARTT_MILLIS, MIN_ARTT_MILLIS};
use crate::core::state::ConnState;

use super::error::{P2pError, P2pResult};

/*
  A connection sends two kinds of frames:

  Frames sent via the data socket "sock" and frames sent via the meta
  data socket "msock"

                    sock                      msock
  -----------------+-------------------------+---------------------------
  timeout           net_conf.timeout          avg round trip time x 4
  timeout action    send a ping via msock     abort the session and
                                              close both sockets
*/

// The two-socket pair to one peer. Owns both write halves; the read
// halves are handed to the receiver and ack-receiver tasks at startup.
pub struct Connection {
    // data-socket single-writer lock
    data_out: Mutex<OwnedWriteHalf>,
    // explicit meta-send lock: pings and every kind of ack go through
    // here, one writer at a time
    meta_out: Mutex<OwnedWriteHalf>,
    address: SocketAddr,
    outgoing: bool,
    state: std::sync::Mutex<ConnState>,
    // exponentially tracked ack round trip time, in milliseconds
    artt_millis: AtomicU64,
    // the data path wants liveness proof on the meta path
    send_ping: AtomicBool,
    ping_notify: Notify,
    // timestamp of the last ping ack seen
    last_ping_ack: AtomicU64,
    // timestamp of the ping currently in flight, zero when none
    ping_sent: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    closed: AtomicBool,
    // data-socket send timeout from the negotiated net config
    data_timeout: Duration,
}

impl Connection {
    pub fn new(
        data: TcpStream,
        meta: TcpStream,
        outgoing: bool,
        data_timeout: Duration,
    ) -> (Self, OwnedReadHalf, OwnedReadHalf) {
        let address = data
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (data_in, data_out) = data.into_split();
        let (meta_in, meta_out) = meta.into_split();
        (
            Self {
                data_out: Mutex::new(data_out),
                meta_out: Mutex::new(meta_out),
                address,
                outgoing,
                state: std::sync::Mutex::new(ConnState::WfReportParams),
                artt_millis: AtomicU64::new(INITIAL_ARTT_MILLIS),
                send_ping: AtomicBool::new(false),
                ping_notify: Notify::new(),
                last_ping_ack: AtomicU64::new(0),
                ping_sent: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                data_timeout,
            },
            data_in,
            meta_in,
        )
    }

    pub fn get_address(&self) -> &SocketAddr {
        &self.address
    }

    pub fn is_out(&self) -> bool {
        self.outgoing
    }

    pub fn get_state(&self) -> ConnState {
        *self.state.lock().expect("conn state lock poisoned")
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("conn state lock poisoned") = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::SeqCst)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::SeqCst)
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // artt and ping bookkeeping
    // ------------------------------------------------------------------

    pub fn artt(&self) -> Duration {
        Duration::from_millis(self.artt_millis.load(Ordering::SeqCst))
    }

    // Fold a fresh ack round-trip sample into the tracked average
    pub fn update_artt(&self, sample: Duration) {
        let sample = (sample.as_millis() as u64).max(MIN_ARTT_MILLIS);
        let old = self.artt_millis.load(Ordering::SeqCst);
        let new = (old * 3 + sample) / 4;
        self.artt_millis.store(new, Ordering::SeqCst);
        trace!("artt {} -> {} ms", old, new);
    }

    fn meta_timeout(&self) -> Duration {
        self.artt() * 4
    }

    // The data path saw no progress: have the ack receiver probe the
    // peer on the meta socket
    pub fn request_ping(&self) {
        self.send_ping.store(true, Ordering::SeqCst);
        self.ping_notify.notify_waiters();
    }

    pub fn take_ping_request(&self) -> bool {
        self.send_ping.swap(false, Ordering::SeqCst)
    }

    pub async fn wait_ping_request(&self) {
        loop {
            if self.send_ping.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.ping_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.send_ping.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn record_ping_ack(&self) {
        self.last_ping_ack
            .store(get_current_time_in_millis(), Ordering::SeqCst);
    }

    // A ping left for the peer; its answer measures the round trip
    pub fn record_ping_sent(&self) {
        self.ping_sent
            .store(get_current_time_in_millis(), Ordering::SeqCst);
    }

    // Round trip of the ping currently in flight, if any
    pub fn take_ping_rtt(&self) -> Option<Duration> {
        let sent = self.ping_sent.swap(0, Ordering::SeqCst);
        if sent == 0 {
            return None;
        }
        Some(Duration::from_millis(
            get_current_time_in_millis().saturating_sub(sent),
        ))
    }

    fn ping_ack_since(&self, mark: u64) -> bool {
        self.last_ping_ack.load(Ordering::SeqCst) >= mark
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    // Send a frame on the data socket. A stalled send escalates to a
    // ping on the meta socket; a stall that outlives the ping answer
    // window declares the session dead.
    pub async fn send_data(&self, frame: Bytes) -> P2pResult<()> {
        let mut sock = self.data_out.lock().await;
        let mut sent = 0usize;
        let mut ping_mark: Option<u64> = None;

        while sent < frame.len() {
            match timeout(self.data_timeout, sock.write(&frame[sent..])).await {
                Ok(Ok(0)) => {
                    return Err(P2pError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "peer closed the data socket",
                    )))
                }
                Ok(Ok(n)) => {
                    sent += n;
                    if sent < frame.len() {
                        trace!("partial data send, continuing ({}/{})", sent, frame.len());
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    if let Some(mark) = ping_mark {
                        if !self.ping_ack_since(mark) {
                            error!("send timed out on {} with no ping answer", self.address);
                            return Err(P2pError::SendTimeout);
                        }
                    }
                    warn!(
                        "send to {} stalled for {:?}, requesting ping",
                        self.address, self.data_timeout
                    );
                    ping_mark = Some(get_current_time_in_millis());
                    self.request_ping();
                }
            }
        }

        self.bytes_out.fetch_add(frame.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    // Send a frame on the meta socket. There is no ping-the-ping-channel
    // recourse: a stall here breaks the session immediately.
    pub async fn send_meta(&self, frame: Bytes) -> P2pResult<()> {
        let deadline = self.meta_timeout();
        let mut sock = self.meta_out.lock().await;
        let mut sent = 0usize;

        while sent < frame.len() {
            match timeout(deadline, sock.write(&frame[sent..])).await {
                Ok(Ok(0)) => {
                    return Err(P2pError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "peer closed the meta socket",
                    )))
                }
                Ok(Ok(n)) => sent += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    error!("meta send to {} expired after {:?}", self.address, deadline);
                    return Err(P2pError::MetaSendTimeout);
                }
            }
        }

        self.bytes_out.fetch_add(frame.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.mark_closed();
        let mut data = self.data_out.lock().await;
        let _ = data.shutdown().await;
        let mut meta = self.meta_out.lock().await;
        let _ = meta.shutdown().await;
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection[peer: {}, out: {}, state: {}, tx/rx: {}/{}]",
            self.address,
            self.outgoing,
            self.get_state(),
            self.bytes_out(),
            self.bytes_in()
        )
    }
}
