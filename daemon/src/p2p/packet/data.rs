use bytes::Bytes;
use vblock_common::serializer::{Reader, ReaderError, Serializer, Writer};

// A mirrored write, or the answer to a remote read. The block_id is
// the originator's cookie, opaque to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sector: u64,
    pub block_id: u64,
    pub data: Bytes,
}

impl Serializer for DataPacket {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.sector);
        writer.write_u64(&self.block_id);
        writer.write_bytes(&self.data);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let sector = reader.read_u64()?;
        let block_id = reader.read_u64()?;
        // the payload runs to the end of the frame
        let data = Bytes::from(reader.read_bytes(reader.size())?);
        Ok(Self {
            sector,
            block_id,
            data,
        })
    }

    fn size(&self) -> usize {
        16 + self.data.len()
    }
}

// Ask the peer for block data (read shipping)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub sector: u64,
    pub block_id: u64,
    pub size: u32,
}

impl Serializer for DataRequest {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.sector);
        writer.write_u64(&self.block_id);
        writer.write_u32(&self.size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let sector = reader.read_u64()?;
        let block_id = reader.read_u64()?;
        let size = reader.read_u32()?;
        Ok(Self {
            sector,
            block_id,
            size,
        })
    }

    fn size(&self) -> usize {
        20
    }
}

// The epoch framing marker; durability of the epoch is reported by the
// matching barrier ack on the meta socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPacket {
    pub barrier_nr: u32,
}

impl Serializer for BarrierPacket {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(&self.barrier_nr);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            barrier_nr: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        4
    }
}

// The peer should not receive data for this range but must learn it is
// stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSyncPacket {
    pub sector: u64,
    pub size: u32,
}

impl Serializer for OutOfSyncPacket {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.sector);
        writer.write_u32(&self.size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let sector = reader.read_u64()?;
        let size = reader.read_u32()?;
        Ok(Self { sector, size })
    }

    fn size(&self) -> usize {
        12
    }
}
