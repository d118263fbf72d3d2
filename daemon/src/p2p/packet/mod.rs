mod ack;
mod data;
mod handshake;

pub use ack::{BarrierAckPacket, BlockAck, CStatePacket};
pub use data::{BarrierPacket, DataPacket, DataRequest, OutOfSyncPacket};
pub use handshake::ReportParams;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use vblock_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::config::WIRE_MAGIC;

use super::error::{P2pError, P2pResult};

pub const HEADER_SIZE: usize = 8;

// Packet tags. The data socket carries params, data, barriers and read
// shipping; the meta socket carries every kind of ack plus pings.
pub mod command {
    pub const REPORT_PARAMS: u16 = 0x01;
    pub const DATA: u16 = 0x02;
    pub const BARRIER: u16 = 0x03;
    pub const OUT_OF_SYNC: u16 = 0x04;
    pub const DATA_REQUEST: u16 = 0x05;
    pub const DATA_REPLY: u16 = 0x06;

    pub const RECV_ACK: u16 = 0x10;
    pub const WRITE_ACK: u16 = 0x11;
    pub const WRITE_ACK_SIS: u16 = 0x12;
    pub const NEG_ACK: u16 = 0x13;
    pub const DISCARD_ACK: u16 = 0x14;
    pub const POSTPONE_ACK: u16 = 0x15;
    pub const BARRIER_ACK: u16 = 0x16;

    pub const PING: u16 = 0x20;
    pub const PING_ACK: u16 = 0x21;
    pub const CSTATE_CHANGED: u16 = 0x30;
}

// Fixed frame header on both sockets: magic, command, payload length.
// Big-endian everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub length: u16,
}

impl Serializer for Header {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(&WIRE_MAGIC);
        writer.write_u16(self.command);
        writer.write_u16(self.length);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let magic = reader.read_u32()?;
        if magic != WIRE_MAGIC {
            return Err(ReaderError::InvalidValue);
        }
        let command = reader.read_u16()?;
        let length = reader.read_u16()?;
        Ok(Self { command, length })
    }

    fn size(&self) -> usize {
        HEADER_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReportParams(ReportParams),
    Data(DataPacket),
    DataRequest(DataRequest),
    DataReply(DataPacket),
    Barrier(BarrierPacket),
    OutOfSync(OutOfSyncPacket),
    RecvAck(BlockAck),
    WriteAck(BlockAck),
    WriteAckSis(BlockAck),
    NegAck(BlockAck),
    DiscardAck(BlockAck),
    PostponeAck(BlockAck),
    BarrierAck(BarrierAckPacket),
    Ping,
    PingAck,
    CStateChanged(CStatePacket),
}

impl Packet {
    pub fn command(&self) -> u16 {
        match self {
            Packet::ReportParams(_) => command::REPORT_PARAMS,
            Packet::Data(_) => command::DATA,
            Packet::DataRequest(_) => command::DATA_REQUEST,
            Packet::DataReply(_) => command::DATA_REPLY,
            Packet::Barrier(_) => command::BARRIER,
            Packet::OutOfSync(_) => command::OUT_OF_SYNC,
            Packet::RecvAck(_) => command::RECV_ACK,
            Packet::WriteAck(_) => command::WRITE_ACK,
            Packet::WriteAckSis(_) => command::WRITE_ACK_SIS,
            Packet::NegAck(_) => command::NEG_ACK,
            Packet::DiscardAck(_) => command::DISCARD_ACK,
            Packet::PostponeAck(_) => command::POSTPONE_ACK,
            Packet::BarrierAck(_) => command::BARRIER_ACK,
            Packet::Ping => command::PING,
            Packet::PingAck => command::PING_ACK,
            Packet::CStateChanged(_) => command::CSTATE_CHANGED,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Packet::ReportParams(p) => p.size(),
            Packet::Data(p) | Packet::DataReply(p) => p.size(),
            Packet::DataRequest(p) => p.size(),
            Packet::Barrier(p) => p.size(),
            Packet::OutOfSync(p) => p.size(),
            Packet::RecvAck(p)
            | Packet::WriteAck(p)
            | Packet::WriteAckSis(p)
            | Packet::NegAck(p)
            | Packet::DiscardAck(p)
            | Packet::PostponeAck(p) => p.size(),
            Packet::BarrierAck(p) => p.size(),
            Packet::Ping | Packet::PingAck => 0,
            Packet::CStateChanged(p) => p.size(),
        }
    }

    fn write_payload(&self, writer: &mut Writer) {
        match self {
            Packet::ReportParams(p) => p.write(writer),
            Packet::Data(p) | Packet::DataReply(p) => p.write(writer),
            Packet::DataRequest(p) => p.write(writer),
            Packet::Barrier(p) => p.write(writer),
            Packet::OutOfSync(p) => p.write(writer),
            Packet::RecvAck(p)
            | Packet::WriteAck(p)
            | Packet::WriteAckSis(p)
            | Packet::NegAck(p)
            | Packet::DiscardAck(p)
            | Packet::PostponeAck(p) => p.write(writer),
            Packet::BarrierAck(p) => p.write(writer),
            Packet::Ping | Packet::PingAck => {}
            Packet::CStateChanged(p) => p.write(writer),
        }
    }

    // Serialize into one wire frame: header followed by the payload
    pub fn to_frame(&self) -> Bytes {
        let payload_size = self.payload_size();
        debug_assert!(payload_size <= u16::MAX as usize);
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload_size);
        let mut writer = Writer::new(&mut bytes);
        let header = Header {
            command: self.command(),
            length: payload_size as u16,
        };
        header.write(&mut writer);
        self.write_payload(&mut writer);
        Bytes::from(bytes)
    }

    // Rebuild a packet from a validated header and its payload bytes.
    // Trailing payload bytes are a protocol violation, not slack.
    pub fn from_command(command: u16, payload: &[u8]) -> P2pResult<Self> {
        let mut reader = Reader::new(payload);
        let packet = match command {
            command::REPORT_PARAMS => Packet::ReportParams(ReportParams::read(&mut reader)?),
            command::DATA => Packet::Data(DataPacket::read(&mut reader)?),
            command::DATA_REQUEST => Packet::DataRequest(DataRequest::read(&mut reader)?),
            command::DATA_REPLY => Packet::DataReply(DataPacket::read(&mut reader)?),
            command::BARRIER => Packet::Barrier(BarrierPacket::read(&mut reader)?),
            command::OUT_OF_SYNC => Packet::OutOfSync(OutOfSyncPacket::read(&mut reader)?),
            command::RECV_ACK => Packet::RecvAck(BlockAck::read(&mut reader)?),
            command::WRITE_ACK => Packet::WriteAck(BlockAck::read(&mut reader)?),
            command::WRITE_ACK_SIS => Packet::WriteAckSis(BlockAck::read(&mut reader)?),
            command::NEG_ACK => Packet::NegAck(BlockAck::read(&mut reader)?),
            command::DISCARD_ACK => Packet::DiscardAck(BlockAck::read(&mut reader)?),
            command::POSTPONE_ACK => Packet::PostponeAck(BlockAck::read(&mut reader)?),
            command::BARRIER_ACK => Packet::BarrierAck(BarrierAckPacket::read(&mut reader)?),
            command::PING => Packet::Ping,
            command::PING_ACK => Packet::PingAck,
            command::CSTATE_CHANGED => Packet::CStateChanged(CStatePacket::read(&mut reader)?),
            other => return Err(P2pError::UnknownCommand(other)),
        };
        if reader.size() > 0 {
            return Err(P2pError::TrailingData(reader.size()));
        }
        Ok(packet)
    }
}

// Read one frame off a socket: fixed header, then exactly the
// advertised payload. Bad magic and length overruns surface as errors
// that drop the session.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> P2pResult<Packet> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = {
        let mut r = Reader::new(&header_bytes);
        match Header::read(&mut r) {
            Ok(header) => header,
            Err(_) => {
                let magic = u32::from_be_bytes([
                    header_bytes[0],
                    header_bytes[1],
                    header_bytes[2],
                    header_bytes[3],
                ]);
                return Err(P2pError::InvalidMagic(magic));
            }
        }
    };
    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    Packet::from_command(header.command, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = Header {
            command: command::DATA,
            length: 0x1234,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &WIRE_MAGIC.to_be_bytes());
        assert_eq!(&bytes[4..6], &command::DATA.to_be_bytes());
        assert_eq!(&bytes[6..8], &[0x12, 0x34]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Header {
            command: command::PING,
            length: 0,
        }
        .to_bytes();
        bytes[0] ^= 0xFF;
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let packet = Packet::Data(DataPacket {
            sector: 8,
            block_id: 0xDEAD_BEEF,
            data: Bytes::from(vec![7u8; 4096]),
        });
        let frame = packet.to_frame();
        let header = Header::from_bytes(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(header.command, command::DATA);
        assert_eq!(header.length as usize, 16 + 4096);
        let decoded = Packet::from_command(header.command, &frame[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_trailing_payload_rejected() {
        let mut payload = BarrierPacket { barrier_nr: 3 }.to_bytes();
        payload.push(0);
        assert!(matches!(
            Packet::from_command(command::BARRIER, &payload),
            Err(P2pError::TrailingData(1))
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(matches!(
            Packet::from_command(0x7777, &[]),
            Err(P2pError::UnknownCommand(0x7777))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_from_socket_pair() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (_, mut write_half) = tokio::io::split(client);
        let (mut read_half, _) = tokio::io::split(server);

        let packet = Packet::WriteAck(BlockAck::new(16, 42));
        {
            use tokio::io::AsyncWriteExt;
            write_half.write_all(&packet.to_frame()).await.unwrap();
        }
        let decoded = read_frame(&mut read_half).await.unwrap();
        assert_eq!(decoded, packet);
    }

    proptest! {
        // pack-then-unpack yields the original tuple for every ack tag
        #[test]
        fn prop_block_ack_round_trip(sector in any::<u64>(), block_id in any::<u64>()) {
            let ack = BlockAck::new(sector, block_id);
            for tag in [
                command::RECV_ACK,
                command::WRITE_ACK,
                command::WRITE_ACK_SIS,
                command::NEG_ACK,
            ] {
                let decoded = Packet::from_command(tag, &ack.to_bytes()).unwrap();
                let inner = match decoded {
                    Packet::RecvAck(a)
                    | Packet::WriteAck(a)
                    | Packet::WriteAckSis(a)
                    | Packet::NegAck(a) => a,
                    other => panic!("unexpected packet {:?}", other),
                };
                prop_assert_eq!(inner, ack);
            }
        }

        #[test]
        fn prop_report_params_round_trip(
            device_size in any::<u64>(),
            state in any::<u32>(),
            gen in any::<[u32; 5]>(),
        ) {
            let params = ReportParams {
                device_size,
                block_size: 4096,
                state,
                protocol: 3,
                version: 1,
                gen_cnt: gen,
            };
            let decoded = ReportParams::from_bytes(&params.to_bytes()).unwrap();
            prop_assert_eq!(decoded, params);
        }

        #[test]
        fn prop_barrier_ack_round_trip(nr in any::<u32>(), set_size in any::<u32>()) {
            let ack = BarrierAckPacket { barrier_nr: nr, set_size };
            let decoded = BarrierAckPacket::from_bytes(&ack.to_bytes()).unwrap();
            prop_assert_eq!(decoded, ack);
        }
    }
}
