mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

// Trait implemented by every type that crosses the wire or hits disk.
// All multi-byte integers are big-endian, on every platform.
pub trait Serializer: Sized {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    // Serialized size in bytes, used to pre-size buffers and to fill
    // frame length fields without serializing twice.
    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        let mut writer = Writer::new(&mut bytes);
        self.write(&mut writer);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        Self::read(&mut reader)
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        let value: u64 = 0xDEAD_BEEF_CAFE_F00D;
        let bytes = value.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u64::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn test_big_endian_layout() {
        let value: u32 = 0x0102_0304;
        assert_eq!(value.to_bytes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_truncated_input() {
        assert!(u64::from_bytes(&[0u8; 4]).is_err());
    }
}
