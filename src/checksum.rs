//! CRC32C (Castagnoli) as ext4 uses it for metadata checksums.
//!
//! The kernel keeps its crc state uninverted; the `crc32c` crate keeps the
//! standard (inverted) form. Folding bytes with `crc32c_append` from state 0 and
//! finishing with `0xffff_ffff - state` yields exactly the kernel's value.

/// Accumulates the bytes covered by one metadata checksum.
///
/// Every object except the superblock starts from the volume seed
/// `crc32c(~0, uuid)`; objects owned by an inode additionally fold in the inode
/// number and generation before their payload.
pub struct Checksummer {
    crc: u32,
}

impl Checksummer {
    /// Start an unseeded accumulator (superblock checksum only).
    pub fn unseeded() -> Self {
        Checksummer { crc: 0 }
    }

    /// Start from the volume UUID seed.
    pub fn new(uuid: &[u8; 16]) -> Self {
        Checksummer {
            crc: crc32c::crc32c_append(0, uuid),
        }
    }

    /// Start from the UUID seed plus an owning inode's number and generation.
    pub fn for_inode(uuid: &[u8; 16], inode_num: u32, generation: u32) -> Self {
        let mut c = Checksummer::new(uuid);
        c.write_u32(inode_num);
        c.write_u32(generation);
        c
    }

    pub fn write(&mut self, buf: &[u8]) -> &mut Self {
        self.crc = crc32c::crc32c_append(self.crc, buf);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn finish(&self) -> u32 {
        0xffff_ffff - self.crc
    }
}

/// Superblock checksum: unseeded crc32c over the 1020 bytes before the
/// `s_checksum` field.
pub fn superblock_csum(sb_bytes: &[u8]) -> u32 {
    Checksummer::unseeded().write(&sb_bytes[..0x3FC]).finish()
}

/// Group descriptor checksum: seed, group number, descriptor bytes with the
/// 16-bit `bg_checksum` field (offset 0x1E) zeroed. Only the low 16 bits are
/// stored.
pub fn group_desc_csum(uuid: &[u8; 16], group_num: u64, desc_bytes: &[u8]) -> u16 {
    let mut c = Checksummer::new(uuid);
    c.write_u32(group_num as u32);
    c.write(&desc_bytes[..0x1E]);
    c.write(&[0u8; 2]);
    c.write(&desc_bytes[0x20..]);
    c.finish() as u16
}

/// Inode checksum: seed, inode number, generation, then the raw inode bytes
/// with both checksum halves (0x7C and, past 128 bytes, 0x82) zeroed.
pub fn inode_csum(uuid: &[u8; 16], inode_num: u32, generation: u32, inode_bytes: &[u8]) -> u32 {
    let mut c = Checksummer::for_inode(uuid, inode_num, generation);
    c.write(&inode_bytes[..0x7C]);
    c.write(&[0u8; 2]);
    if inode_bytes.len() > 128 {
        c.write(&inode_bytes[0x7E..0x82]);
        c.write(&[0u8; 2]);
        c.write(&inode_bytes[0x84..]);
    } else {
        c.write(&inode_bytes[0x7E..]);
    }
    c.finish()
}

/// Bitmap checksum: seed then the covered bitmap bytes. Stored split lo/hi in
/// the owning group descriptor, not in the bitmap block itself.
pub fn bitmap_csum(uuid: &[u8; 16], bitmap: &[u8]) -> u32 {
    Checksummer::new(uuid).write(bitmap).finish()
}

/// Directory block checksum: per-inode seed over everything before the 12-byte
/// tail entry.
pub fn dir_block_csum(uuid: &[u8; 16], inode_num: u32, generation: u32, block: &[u8]) -> u32 {
    let covered = &block[..block.len() - 12];
    Checksummer::for_inode(uuid, inode_num, generation)
        .write(covered)
        .finish()
}

/// Extent node checksum: per-inode seed over the node bytes up to the tail,
/// which sits after `eh_max` entry slots.
pub fn extent_block_csum(
    uuid: &[u8; 16],
    inode_num: u32,
    generation: u32,
    block: &[u8],
    tail_offset: usize,
) -> u32 {
    Checksummer::for_inode(uuid, inode_num, generation)
        .write(&block[..tail_offset])
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_is_castagnoli() {
        // standard CRC-32C check value
        assert_eq!(crc32c::crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_finish_is_bitwise_not() {
        let mut c = Checksummer::unseeded();
        c.write(b"123456789");
        assert_eq!(c.finish(), !0xE306_9283u32);
    }

    #[test]
    fn test_chunked_writes_match_one_shot() {
        let uuid = [0x42u8; 16];
        let mut a = Checksummer::new(&uuid);
        a.write(b"hello world");
        let mut b = Checksummer::new(&uuid);
        b.write(b"hello ").write(b"world");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_inode_csum_ignores_stored_checksum() {
        let uuid = [7u8; 16];
        let mut inode = vec![0u8; 256];
        inode[0] = 0xA4;
        let clean = inode_csum(&uuid, 12, 3, &inode);
        inode[0x7C] = 0xFF;
        inode[0x7D] = 0xFF;
        inode[0x82] = 0xFF;
        inode[0x83] = 0xFF;
        assert_eq!(inode_csum(&uuid, 12, 3, &inode), clean);
    }

    #[test]
    fn test_group_desc_csum_ignores_stored_checksum() {
        let uuid = [9u8; 16];
        let mut desc = vec![0u8; 64];
        desc[0] = 0x11;
        let clean = group_desc_csum(&uuid, 5, &desc);
        desc[0x1E] = 0xAA;
        desc[0x1F] = 0xBB;
        assert_eq!(group_desc_csum(&uuid, 5, &desc), clean);
    }
}
