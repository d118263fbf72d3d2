use vblock_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::core::metadata::GEN_CNT_SIZE;

// First packet on a fresh connection, in both directions. The
// generation counters decide which side has the good data; state,
// protocol and version are cross-checked before anything else flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportParams {
    pub device_size: u64,
    pub block_size: u32,
    pub state: u32,
    pub protocol: u32,
    pub version: u32,
    pub gen_cnt: [u32; GEN_CNT_SIZE],
}

impl Serializer for ReportParams {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.device_size);
        writer.write_u32(&self.block_size);
        writer.write_u32(&self.state);
        writer.write_u32(&self.protocol);
        writer.write_u32(&self.version);
        for value in &self.gen_cnt {
            writer.write_u32(value);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let device_size = reader.read_u64()?;
        let block_size = reader.read_u32()?;
        let state = reader.read_u32()?;
        let protocol = reader.read_u32()?;
        let version = reader.read_u32()?;
        let mut gen_cnt = [0u32; GEN_CNT_SIZE];
        for value in &mut gen_cnt {
            *value = reader.read_u32()?;
        }
        Ok(Self {
            device_size,
            block_size,
            state,
            protocol,
            version,
            gen_cnt,
        })
    }

    fn size(&self) -> usize {
        8 + 4 * 4 + GEN_CNT_SIZE * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_params_round_trip() {
        let params = ReportParams {
            device_size: 1 << 30,
            block_size: 4096,
            state: 1,
            protocol: 3,
            version: 1,
            gen_cnt: [1, 2, 3, 4, 1],
        };
        let bytes = params.to_bytes();
        assert_eq!(bytes.len(), params.size());
        assert_eq!(ReportParams::from_bytes(&bytes).unwrap(), params);
    }
}
