use std::sync::Arc;

use log::{debug, error, trace, warn};
use metrics::counter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::device::{Device, PeerDevice};
use crate::core::request::RequestEvent;
use crate::core::state::ConnState;

use super::connection::Connection;
use super::packet::{read_frame, Packet};

// Meta-socket reader, one task per connection. Every block ack is
// translated into a state-machine event addressed by the echoed cookie;
// a barrier-accounting fault here is session-fatal.
pub fn spawn_ack_receiver(
    device: Arc<Device>,
    peer: Arc<PeerDevice>,
    connection: Arc<Connection>,
    mut meta_in: OwnedReadHalf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let packet = match read_frame(&mut meta_in).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("{}: meta socket read failed: {}", device.name(), e);
                    peer.request_teardown(ConnState::BrokenPipe);
                    break;
                }
            };
            if !dispatch(&device, &peer, &connection, packet).await {
                break;
            }
        }
        trace!("{}: ack receiver exiting", device.name());
    })
}

// Meta-socket writer: transmits pings when the data path asks for
// liveness proof, and drains the outbound ack queue fed by the receive
// side. Uses the meta send lock; never touches the read half.
pub fn spawn_meta_writer(
    device: Arc<Device>,
    peer: Arc<PeerDevice>,
    connection: Arc<Connection>,
    mut meta_out: UnboundedReceiver<Packet>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = connection.wait_ping_request() => {
                    if !connection.take_ping_request() {
                        continue;
                    }
                    trace!("{}: sending ping", device.name());
                    connection.record_ping_sent();
                    if connection.send_meta(Packet::Ping.to_frame()).await.is_err() {
                        peer.request_teardown(ConnState::BrokenPipe);
                        break;
                    }
                }

                outbound = meta_out.recv() => {
                    let Some(packet) = outbound else {
                        break;
                    };
                    if connection.send_meta(packet.to_frame()).await.is_err() {
                        peer.request_teardown(ConnState::BrokenPipe);
                        break;
                    }
                }
            }
        }
        trace!("{}: meta writer exiting", device.name());
    })
}

// Returns false when the session must end
async fn dispatch(
    device: &Arc<Device>,
    peer: &Arc<PeerDevice>,
    connection: &Arc<Connection>,
    packet: Packet,
) -> bool {
    counter!("vblock_p2p_meta_packets_in").increment(1u64);
    match packet {
        Packet::Ping => {
            if connection
                .send_meta(Packet::PingAck.to_frame())
                .await
                .is_err()
            {
                peer.request_teardown(ConnState::BrokenPipe);
                return false;
            }
        }

        Packet::PingAck => {
            if let Some(rtt) = connection.take_ping_rtt() {
                connection.update_artt(rtt);
            }
            connection.record_ping_ack();
        }

        Packet::RecvAck(ack) => {
            device.req_event(ack.block_id, RequestEvent::RecvAckedByPeer);
        }

        Packet::WriteAck(ack) => {
            device.req_event(ack.block_id, RequestEvent::WriteAckedByPeer);
        }

        Packet::WriteAckSis(ack) => {
            device.req_event(ack.block_id, RequestEvent::WriteAckedByPeerAndSis);
        }

        Packet::NegAck(ack) => {
            warn!("{}: negative ack for block {}", device.name(), ack.sector);
            device.req_event(ack.block_id, RequestEvent::NegAcked);
        }

        Packet::DiscardAck(ack) => {
            debug!(
                "{}: peer discarded conflicting write at {}",
                device.name(),
                ack.sector
            );
            device.req_event(ack.block_id, RequestEvent::DiscardWrite);
        }

        Packet::PostponeAck(ack) => {
            debug!(
                "{}: peer postponed conflicting write at {}",
                device.name(),
                ack.sector
            );
            device.req_event(ack.block_id, RequestEvent::PostponeWrite);
        }

        Packet::BarrierAck(ack) => {
            if let Err(e) = device.barrier_ack(ack.barrier_nr, ack.set_size) {
                // the local and peer views of the transfer log have
                // diverged; the session cannot continue
                error!("{}: {}", device.name(), e);
                peer.request_teardown(ConnState::BrokenPipe);
                return false;
            }
        }

        Packet::CStateChanged(cstate) => match ConnState::from_wire(cstate.cstate) {
            Some(state) => debug!("{}: peer connection state now {}", device.name(), state),
            None => warn!(
                "{}: peer sent unknown cstate {}",
                device.name(),
                cstate.cstate
            ),
        },

        other => {
            error!(
                "{}: unexpected packet {:#06x} on the meta socket",
                device.name(),
                other.command()
            );
            peer.request_teardown(ConnState::BrokenPipe);
            return false;
        }
    }
    true
}
