use std::io::{self, Read, Seek, SeekFrom, Write};

/// Anything the engine can use as a backing device.
pub trait ByteDevice: Read + Write + Seek {}
impl<D: Read + Write + Seek> ByteDevice for D {}

/// A view of the backing device shifted by the volume's start offset, so the
/// engine addresses the ext4 volume as if it began at byte 0.
#[derive(Debug)]
pub struct Volume<D: ByteDevice> {
    dev: D,
    start: u64,
}

impl<D: ByteDevice> Volume<D> {
    pub fn new(dev: D, start: u64) -> Self {
        Volume { dev, start }
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.dev.seek(SeekFrom::Start(self.start + offset))?;
        self.dev.read_exact(buf)
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.dev.seek(SeekFrom::Start(self.start + offset))?;
        self.dev.write_all(buf)
    }

    pub fn into_inner(self) -> D {
        self.dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_offsets_are_relative_to_start() {
        let mut vol = Volume::new(Cursor::new(vec![0u8; 64]), 16);
        vol.write_at(4, &[0xAB, 0xCD]).unwrap();

        let mut buf = [0u8; 2];
        vol.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [0xAB, 0xCD]);

        let inner = vol.into_inner().into_inner();
        assert_eq!(&inner[20..22], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let mut vol = Volume::new(Cursor::new(vec![0u8; 8]), 0);
        let mut buf = [0u8; 16];
        assert!(vol.read_at(0, &mut buf).is_err());
    }
}
