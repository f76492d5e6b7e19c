//! Bitmap-backed allocation of inodes and block runs.
//!
//! Mutation order is fixed: bitmap first, then the group descriptor, then the
//! superblock counters.

use log::debug;

use crate::checksum;
use crate::device::ByteDevice;
use crate::error::{Ext4Error, Result};
use crate::Ext4Fs;

pub(crate) fn test_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

pub(crate) fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

pub(crate) fn clear_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

/// First zero bit below `nbits`.
fn find_zero_bit(bitmap: &[u8], nbits: usize) -> Option<usize> {
    (0..nbits).find(|&bit| !test_bit(bitmap, bit))
}

/// First run of zero bits below `nbits`, clipped to `want` bits.
fn find_zero_run(bitmap: &[u8], nbits: usize, want: u64) -> Option<(usize, u64)> {
    let first = find_zero_bit(bitmap, nbits)?;
    let mut len = 1u64;
    while len < want && first + (len as usize) < nbits && !test_bit(bitmap, first + len as usize) {
        len += 1;
    }
    Some((first, len))
}

impl<D: ByteDevice> Ext4Fs<D> {
    fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        let bs = self.block_size();
        let mut buf = vec![0u8; bs as usize];
        self.vol.read_at(block * bs, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        let bs = self.block_size();
        self.vol.write_at(block * bs, buf)?;
        Ok(())
    }

    /// Number of usable bits in the given group's block bitmap; the last group
    /// may cover less than a full group of blocks.
    fn group_block_bits(&self, group: u64) -> usize {
        let bpg = self.sb.s_blocks_per_group as u64;
        let first = self.group_first_block(group);
        (self.sb.blocks_count() - first).min(bpg) as usize
    }

    pub(crate) fn group_first_block(&self, group: u64) -> u64 {
        self.sb.s_first_data_block as u64 + group * self.sb.s_blocks_per_group as u64
    }

    /// Claim the first free inode of any group. Returns its 1-based number.
    pub(crate) fn alloc_inode(&mut self) -> Result<u32> {
        let ipg = self.sb.s_inodes_per_group;
        for group in 0..self.sb.block_groups_count() {
            let mut desc = self.read_group_desc(group)?;
            if desc.free_inodes_count() == 0 {
                continue;
            }
            let bitmap_block = desc.inode_bitmap();
            let mut bitmap = self.read_block(bitmap_block)?;
            let Some(bit) = find_zero_bit(&bitmap, ipg as usize) else {
                continue;
            };
            set_bit(&mut bitmap, bit);
            self.write_block(bitmap_block, &bitmap)?;

            if self.sb.has_metadata_csum() {
                let covered = (ipg as usize).div_ceil(8);
                let csum = checksum::bitmap_csum(self.sb.uuid(), &bitmap[..covered]);
                desc.set_inode_bitmap_csum(csum, self.sb.desc_size());
            }
            desc.set_free_inodes_count(desc.free_inodes_count() - 1);
            // keep the uninitialized tail of the inode table consistent
            let unused = desc.itable_unused();
            if (bit as u32) + 1 > ipg.saturating_sub(unused) {
                desc.set_itable_unused(ipg - bit as u32 - 1);
            }
            self.write_group_desc(group, &mut desc)?;

            self.sb.s_free_inodes_count -= 1;
            self.write_superblock()?;

            let num = group as u32 * ipg + bit as u32 + 1;
            debug!("allocated inode {num} in group {group}");
            return Ok(num);
        }
        Err(Ext4Error::NoSpace)
    }

    /// Release one inode number back to its group.
    pub(crate) fn free_inode(&mut self, num: u32, was_dir: bool) -> Result<()> {
        let ipg = self.sb.s_inodes_per_group;
        let group = ((num - 1) / ipg) as u64;
        let bit = ((num - 1) % ipg) as usize;

        let mut desc = self.read_group_desc(group)?;
        let bitmap_block = desc.inode_bitmap();
        let mut bitmap = self.read_block(bitmap_block)?;
        clear_bit(&mut bitmap, bit);
        self.write_block(bitmap_block, &bitmap)?;

        if self.sb.has_metadata_csum() {
            let covered = (ipg as usize).div_ceil(8);
            let csum = checksum::bitmap_csum(self.sb.uuid(), &bitmap[..covered]);
            desc.set_inode_bitmap_csum(csum, self.sb.desc_size());
        }
        desc.set_free_inodes_count(desc.free_inodes_count() + 1);
        if was_dir {
            desc.set_used_dirs_count(desc.used_dirs_count() - 1);
        }
        self.write_group_desc(group, &mut desc)?;

        self.sb.s_free_inodes_count += 1;
        self.write_superblock()?;
        debug!("freed inode {num}");
        Ok(())
    }

    /// Claim a run of up to `want` free blocks from the first group that has
    /// any. Returns `(first_block, run_len)` with `run_len >= 1`; callers
    /// needing more re-enter with the remainder.
    pub(crate) fn get_free_blocks(&mut self, want: u64) -> Result<(u64, u64)> {
        for group in 0..self.sb.block_groups_count() {
            let mut desc = self.read_group_desc(group)?;
            if desc.free_blocks_count() == 0 {
                continue;
            }
            let bitmap_block = desc.block_bitmap();
            let mut bitmap = self.read_block(bitmap_block)?;
            let nbits = self.group_block_bits(group);
            let Some((bit, len)) = find_zero_run(&bitmap, nbits, want) else {
                continue;
            };
            for i in 0..len as usize {
                set_bit(&mut bitmap, bit + i);
            }
            self.write_block(bitmap_block, &bitmap)?;

            if self.sb.has_metadata_csum() {
                let covered = self.sb.s_blocks_per_group as usize / 8;
                let csum = checksum::bitmap_csum(self.sb.uuid(), &bitmap[..covered]);
                desc.set_block_bitmap_csum(csum, self.sb.desc_size());
            }
            desc.set_free_blocks_count(desc.free_blocks_count() - len as u32);
            self.write_group_desc(group, &mut desc)?;

            self.sb
                .set_free_blocks_count(self.sb.free_blocks_count() - len);
            self.write_superblock()?;

            let first = self.group_first_block(group) + bit as u64;
            debug!("allocated {len} block(s) at {first} in group {group}");
            return Ok((first, len));
        }
        Err(Ext4Error::NoSpace)
    }

    /// Release a contiguous block run; the run may cross group boundaries.
    pub(crate) fn free_blocks(&mut self, start: u64, len: u64) -> Result<()> {
        let bpg = self.sb.s_blocks_per_group as u64;
        let mut block = start;
        let end = start + len;
        while block < end {
            let group = (block - self.sb.s_first_data_block as u64) / bpg;
            let group_end = self.group_first_block(group) + bpg;
            let chunk = end.min(group_end) - block;

            let mut desc = self.read_group_desc(group)?;
            let bitmap_block = desc.block_bitmap();
            let mut bitmap = self.read_block(bitmap_block)?;
            let first_bit = (block - self.group_first_block(group)) as usize;
            for i in 0..chunk as usize {
                clear_bit(&mut bitmap, first_bit + i);
            }
            self.write_block(bitmap_block, &bitmap)?;

            if self.sb.has_metadata_csum() {
                let covered = self.sb.s_blocks_per_group as usize / 8;
                let csum = checksum::bitmap_csum(self.sb.uuid(), &bitmap[..covered]);
                desc.set_block_bitmap_csum(csum, self.sb.desc_size());
            }
            desc.set_free_blocks_count(desc.free_blocks_count() + chunk as u32);
            self.write_group_desc(group, &mut desc)?;

            self.sb
                .set_free_blocks_count(self.sb.free_blocks_count() + chunk);
            self.write_superblock()?;
            block += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_ops_are_little_endian_bit_order() {
        let mut bitmap = vec![0u8; 2];
        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 9);
        assert_eq!(bitmap, vec![0b0000_0001, 0b0000_0010]);
        assert!(test_bit(&bitmap, 9));
        clear_bit(&mut bitmap, 9);
        assert!(!test_bit(&bitmap, 9));
    }

    #[test]
    fn test_find_zero_run_clips_at_used_bit() {
        let mut bitmap = vec![0u8; 2];
        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 1);
        set_bit(&mut bitmap, 5);
        assert_eq!(find_zero_run(&bitmap, 16, 8), Some((2, 3)));
    }

    #[test]
    fn test_find_zero_run_honours_want_and_nbits() {
        let bitmap = vec![0u8; 2];
        assert_eq!(find_zero_run(&bitmap, 16, 4), Some((0, 4)));
        assert_eq!(find_zero_run(&bitmap, 3, 8), Some((0, 3)));
    }

    #[test]
    fn test_find_zero_run_full_bitmap() {
        let bitmap = vec![0xFFu8; 2];
        assert_eq!(find_zero_run(&bitmap, 16, 1), None);
    }
}
