use std::sync::Arc;

use log::{debug, error, trace};
use metrics::counter;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::device::{Device, PeerDevice, SendWork};
use crate::core::request::RequestEvent;
use crate::core::state::ConnState;

use super::connection::Connection;
use super::error::P2pError;
use super::packet::{BarrierPacket, DataPacket, DataRequest, OutOfSyncPacket, Packet};

// The per-connection sender: drains the work queue in submission order
// and owns the ordering of data-socket frames. Any barrier whose epoch
// precedes the write about to go out is emitted first, so a Barrier(n)
// frame is always strictly before every write of epoch n+1.
pub fn spawn_sender(
    device: Arc<Device>,
    peer: Arc<PeerDevice>,
    connection: Arc<Connection>,
    mut queue: UnboundedReceiver<SendWork>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(work) = queue.recv().await {
            let result = handle_work(&device, &connection, work).await;
            if let Err(e) = result {
                error!("{}: sender failed: {}", device.name(), e);
                let reason = match e {
                    P2pError::SendTimeout => ConnState::Timeout,
                    _ => ConnState::BrokenPipe,
                };
                peer.request_teardown(reason);
                break;
            }
        }
        trace!("{}: sender exiting", device.name());
    })
}

async fn handle_work(
    device: &Arc<Device>,
    connection: &Arc<Connection>,
    work: SendWork,
) -> Result<(), P2pError> {
    match work {
        SendWork::Data(id) => {
            let Some((interval, epoch_nr, payload)) = device.read_for_send(id) else {
                // canceled while queued
                return Ok(());
            };
            let Some(data) = payload else {
                error!("{}: request {} queued without payload", device.name(), id);
                device.req_event(id, RequestEvent::SendFailed);
                return Ok(());
            };

            send_due_barriers(device, connection, epoch_nr).await?;

            let frame = Packet::Data(DataPacket {
                sector: interval.sector,
                block_id: id,
                data,
            })
            .to_frame();
            match connection.send_data(frame).await {
                Ok(()) => {
                    counter!("vblock_p2p_data_sent").increment(1u64);
                    device.req_event(id, RequestEvent::HandedOverToNetwork);
                    Ok(())
                }
                Err(e) => {
                    device.req_event(id, RequestEvent::SendFailed);
                    Err(e)
                }
            }
        }

        SendWork::ReadRequest(id) => {
            let Some((interval, _epoch_nr, _)) = device.read_for_send(id) else {
                return Ok(());
            };
            let frame = Packet::DataRequest(DataRequest {
                sector: interval.sector,
                block_id: id,
                size: interval.size,
            })
            .to_frame();
            match connection.send_data(frame).await {
                Ok(()) => {
                    device.req_event(id, RequestEvent::HandedOverToNetwork);
                    Ok(())
                }
                Err(e) => {
                    device.req_event(id, RequestEvent::SendFailed);
                    Err(e)
                }
            }
        }

        SendWork::Oos(id) => {
            let Some((interval, _epoch_nr, _)) = device.read_for_send(id) else {
                return Ok(());
            };
            let frame = Packet::OutOfSync(OutOfSyncPacket {
                sector: interval.sector,
                size: interval.size,
            })
            .to_frame();
            match connection.send_data(frame).await {
                Ok(()) => {
                    device.req_event(id, RequestEvent::OosHandedToNetwork);
                    Ok(())
                }
                Err(e) => {
                    device.req_event(id, RequestEvent::SendFailed);
                    Err(e)
                }
            }
        }

        SendWork::Reply {
            sector,
            block_id,
            data,
        } => {
            let frame = Packet::DataReply(DataPacket {
                sector,
                block_id,
                data,
            })
            .to_frame();
            connection.send_data(frame).await
        }
    }
}

// Fence every epoch older than the write about to be sent
async fn send_due_barriers(
    device: &Arc<Device>,
    connection: &Arc<Connection>,
    epoch_nr: u32,
) -> Result<(), P2pError> {
    for barrier_nr in device.barriers_due_before(epoch_nr) {
        debug!("{}: issuing barrier {}", device.name(), barrier_nr);
        let frame = Packet::Barrier(BarrierPacket { barrier_nr }).to_frame();
        connection.send_data(frame).await?;
        counter!("vblock_p2p_barriers_sent").increment(1u64);
    }
    Ok(())
}
