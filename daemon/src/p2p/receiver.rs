use std::sync::Arc;

use log::{debug, error, trace, warn};
use metrics::counter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::WireProtocol;
use crate::core::device::{Device, PeerDevice, SendWork};
use crate::core::interval::BlockInterval;
use crate::core::state::ConnState;

use super::error::P2pError;
use super::packet::{read_frame, BarrierAckPacket, BlockAck, Packet};

// Data-socket reader, one task per connection. On a secondary this is
// the replication data plane: apply mirrored writes, acknowledge them
// per the negotiated protocol, count the epoch and answer barriers.
// On a primary it carries the answers to shipped reads.
pub fn spawn_receiver(
    device: Arc<Device>,
    peer: Arc<PeerDevice>,
    mut data_in: OwnedReadHalf,
    meta_tx: UnboundedSender<Packet>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // writes received since the last barrier; echoed back in the
        // barrier ack so the primary can audit its transfer log
        let mut epoch_set_size: u32 = 0;

        loop {
            let packet = match read_frame(&mut data_in).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("{}: data socket read failed: {}", device.name(), e);
                    peer.request_teardown(ConnState::BrokenPipe);
                    break;
                }
            };
            match handle_packet(&device, &peer, &meta_tx, packet, &mut epoch_set_size).await {
                Ok(()) => {}
                Err(e) => {
                    error!("{}: receiver failed: {}", device.name(), e);
                    peer.request_teardown(ConnState::BrokenPipe);
                    break;
                }
            }
        }
        trace!("{}: receiver exiting", device.name());
    })
}

async fn handle_packet(
    device: &Arc<Device>,
    peer: &Arc<PeerDevice>,
    meta_tx: &UnboundedSender<Packet>,
    packet: Packet,
    epoch_set_size: &mut u32,
) -> Result<(), P2pError> {
    counter!("vblock_p2p_data_packets_in").increment(1u64);
    match packet {
        Packet::Data(data) => {
            *epoch_set_size += 1;
            let interval = BlockInterval::new(data.sector, data.data.len() as u32);
            let ack = BlockAck::new(data.sector, data.block_id);

            // write-write conflict with one of our own in-flight
            // writes: the connection initiator wins, both sides agree
            // on who that is
            if device.has_conflicting_write(&interval) {
                let verdict = if peer.is_out() {
                    // we initiated: our write wins, theirs is dropped
                    Packet::DiscardAck(ack)
                } else {
                    // they initiated: ask them to retry later
                    Packet::PostponeAck(ack)
                };
                warn!(
                    "{}: conflicting peer write at {}, answering {:#06x}",
                    device.name(),
                    interval,
                    verdict.command()
                );
                send_meta(meta_tx, verdict)?;
                return Ok(());
            }

            // protocol B acknowledges receipt before the write is
            // durable
            if peer.protocol() == WireProtocol::B {
                send_meta(meta_tx, Packet::RecvAck(ack))?;
            }

            match device.backing.write(data.sector, data.data).await {
                Ok(()) => {
                    if peer.protocol() == WireProtocol::C {
                        send_meta(meta_tx, Packet::WriteAck(ack))?;
                    }
                }
                Err(e) => {
                    error!("{}: failed to apply peer write: {}", device.name(), e);
                    device.bitmap.set_out_of_sync(&interval);
                    send_meta(meta_tx, Packet::NegAck(ack))?;
                }
            }
            Ok(())
        }

        Packet::Barrier(barrier) => {
            // every write of the epoch has been applied (they are
            // serialized through this task); make them durable, then
            // report the epoch back
            device.backing.flush().await?;
            let ack = BarrierAckPacket {
                barrier_nr: barrier.barrier_nr,
                set_size: *epoch_set_size,
            };
            trace!(
                "{}: barrier {} done, set size {}",
                device.name(),
                ack.barrier_nr,
                ack.set_size
            );
            *epoch_set_size = 0;
            send_meta(meta_tx, Packet::BarrierAck(ack))?;
            Ok(())
        }

        Packet::OutOfSync(oos) => {
            let interval = BlockInterval::new(oos.sector, oos.size);
            device.bitmap.set_out_of_sync(&interval);
            Ok(())
        }

        Packet::DataRequest(request) => {
            match device.backing.read(request.sector, request.size).await {
                Ok(data) => {
                    peer.queue_work(SendWork::Reply {
                        sector: request.sector,
                        block_id: request.block_id,
                        data,
                    });
                }
                Err(e) => {
                    warn!("{}: cannot serve peer read: {}", device.name(), e);
                    send_meta(
                        meta_tx,
                        Packet::NegAck(BlockAck::new(request.sector, request.block_id)),
                    )?;
                }
            }
            Ok(())
        }

        Packet::DataReply(reply) => {
            device.data_received(reply.block_id, reply.data);
            Ok(())
        }

        other => {
            error!(
                "{}: unexpected packet {:#06x} on the data socket",
                device.name(),
                other.command()
            );
            Err(P2pError::UnknownCommand(other.command()))
        }
    }
}

fn send_meta(meta_tx: &UnboundedSender<Packet>, packet: Packet) -> Result<(), P2pError> {
    meta_tx
        .send(packet)
        .map_err(|e| P2pError::SendError(e.to_string()))
}
