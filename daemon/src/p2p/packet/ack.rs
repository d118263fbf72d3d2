use vblock_common::serializer::{Reader, ReaderError, Serializer, Writer};

// Every block-level acknowledgement carries the sector it covers and
// the originator's opaque cookie, echoed byte for byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub sector: u64,
    pub block_id: u64,
}

impl BlockAck {
    pub fn new(sector: u64, block_id: u64) -> Self {
        Self { sector, block_id }
    }
}

impl Serializer for BlockAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.sector);
        writer.write_u64(&self.block_id);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let sector = reader.read_u64()?;
        let block_id = reader.read_u64()?;
        Ok(Self { sector, block_id })
    }

    fn size(&self) -> usize {
        16
    }
}

// The peer has durably stored every write of the epoch this barrier
// closed; set_size is its count of those writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierAckPacket {
    pub barrier_nr: u32,
    pub set_size: u32,
}

impl Serializer for BarrierAckPacket {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(&self.barrier_nr);
        writer.write_u32(&self.set_size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let barrier_nr = reader.read_u32()?;
        let set_size = reader.read_u32()?;
        Ok(Self {
            barrier_nr,
            set_size,
        })
    }

    fn size(&self) -> usize {
        8
    }
}

// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CStatePacket {
    pub cstate: u32,
}

impl Serializer for CStatePacket {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(&self.cstate);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            cstate: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        4
    }
}
