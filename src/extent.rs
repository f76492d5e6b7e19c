//! The extent tree rooted in the inode's 60-byte `i_block` region.
//!
//! Lookup descends through index nodes of arbitrary depth. Growth is bounded
//! to the four inline root entries; writes that would need a deeper tree fail
//! with `FileTooLarge`.

use crate::checksum;
use crate::device::ByteDevice;
use crate::error::{Ext4Error, Result};
use crate::ext4_h::{
    binread_from_buf, binwrite_as_buf, Ext4Extent, Ext4ExtentHeader, Ext4ExtentIdx, Ext4Inode,
    EXTENT_MAGIC,
};
use crate::Ext4Fs;

const HEADER_SIZE: usize = Ext4ExtentHeader::SIZE;
const ENTRY_SIZE: usize = Ext4Extent::SIZE;

/// Initialise an empty extent root in the inline region.
pub(crate) fn init_root(i_block: &mut [u8; 60]) {
    i_block.fill(0);
    let header = binwrite_as_buf(&Ext4ExtentHeader::new_inline_root()).unwrap();
    i_block[..HEADER_SIZE].copy_from_slice(&header);
}

fn parse_header(node: &[u8]) -> Result<Ext4ExtentHeader> {
    let header: Ext4ExtentHeader = binread_from_buf(&node[..HEADER_SIZE])?;
    if header.eh_magic != EXTENT_MAGIC {
        return Err(Ext4Error::Corrupt(format!(
            "extent node magic {:#06x}",
            header.eh_magic
        )));
    }
    let capacity = (node.len() - HEADER_SIZE) / ENTRY_SIZE;
    if header.eh_entries > header.eh_max || header.eh_entries as usize > capacity {
        return Err(Ext4Error::Corrupt(format!(
            "extent node holds {} entries with room for {}",
            header.eh_entries, capacity
        )));
    }
    Ok(header)
}

fn entry_bytes(node: &[u8], i: usize) -> &[u8] {
    &node[HEADER_SIZE + i * ENTRY_SIZE..HEADER_SIZE + (i + 1) * ENTRY_SIZE]
}

fn leaf_entries(node: &[u8], header: &Ext4ExtentHeader) -> Result<Vec<Ext4Extent>> {
    (0..header.eh_entries as usize)
        .map(|i| Ok(binread_from_buf(entry_bytes(node, i))?))
        .collect()
}

fn index_entries(node: &[u8], header: &Ext4ExtentHeader) -> Result<Vec<Ext4ExtentIdx>> {
    (0..header.eh_entries as usize)
        .map(|i| Ok(binread_from_buf(entry_bytes(node, i))?))
        .collect()
}

/// Append a mapping to the inline root, merging with the final extent when the
/// run continues it. Fails with `FileTooLarge` once the four root slots are
/// exhausted or the tree has already grown off-inode.
pub(crate) fn append_to_root(
    i_block: &mut [u8; 60],
    logical: u64,
    physical: u64,
    len: u64,
) -> Result<()> {
    let logical = u32::try_from(logical).map_err(|_| Ext4Error::FileTooLarge)?;
    let len = u16::try_from(len).map_err(|_| Ext4Error::FileTooLarge)?;
    let mut header = parse_header(i_block)?;
    if header.eh_depth != 0 {
        return Err(Ext4Error::FileTooLarge);
    }

    let mut entries = leaf_entries(i_block, &header)?;
    let merged = match entries.last_mut() {
        Some(last)
            if last.ee_block as u64 + last.len() as u64 == logical as u64
                && last.start() + last.len() as u64 == physical
                && last.len() as u32 + len as u32 <= Ext4Extent::MAX_LEN as u32 =>
        {
            last.set_len(last.len() + len);
            true
        }
        _ => false,
    };
    if !merged {
        if entries.len() >= header.eh_max as usize {
            return Err(Ext4Error::FileTooLarge);
        }
        entries.push(Ext4Extent::new(logical, physical, len));
        entries.sort_by_key(|e| e.ee_block);
    }

    header.eh_entries = entries.len() as u16;
    i_block[..HEADER_SIZE].copy_from_slice(&binwrite_as_buf(&header)?);
    for (i, entry) in entries.iter().enumerate() {
        let bytes = binwrite_as_buf(entry)?;
        i_block[HEADER_SIZE + i * ENTRY_SIZE..HEADER_SIZE + (i + 1) * ENTRY_SIZE]
            .copy_from_slice(&bytes);
    }
    Ok(())
}

impl<D: ByteDevice> Ext4Fs<D> {
    fn read_extent_node(&mut self, inode_num: u32, generation: u32, block: u64) -> Result<Vec<u8>> {
        let bs = self.block_size();
        let mut node = vec![0u8; bs as usize];
        self.vol.read_at(block * bs, &mut node)?;
        let header = parse_header(&node)?;
        if self.sb.has_metadata_csum() {
            let tail_offset = HEADER_SIZE + header.eh_max as usize * ENTRY_SIZE;
            if tail_offset + 4 <= bs as usize {
                let stored = u32::from_le_bytes(node[tail_offset..tail_offset + 4].try_into().unwrap());
                let computed = checksum::extent_block_csum(
                    self.sb.uuid(),
                    inode_num,
                    generation,
                    &node,
                    tail_offset,
                );
                if stored != computed {
                    return Err(Ext4Error::ChecksumMismatch {
                        object: "extent block",
                        index: block,
                    });
                }
            }
        }
        Ok(node)
    }

    /// Resolve a file-logical block to its physical block, or `None` for a hole.
    pub(crate) fn map_file_block(
        &mut self,
        inode_num: u32,
        inode: &Ext4Inode,
        lblock: u64,
    ) -> Result<Option<u64>> {
        if !inode.has_extents() {
            return Err(Ext4Error::Unsupported(format!(
                "inode {inode_num} uses legacy indirect block maps"
            )));
        }
        let mut node: Vec<u8> = inode.i_block.to_vec();
        let mut depth_above: Option<u16> = None;
        loop {
            let header = parse_header(&node)?;
            // depth must strictly decrease towards the leaves
            if let Some(above) = depth_above {
                if header.eh_depth + 1 != above {
                    return Err(Ext4Error::Corrupt(format!(
                        "extent node at depth {} under a node at depth {above}",
                        header.eh_depth
                    )));
                }
            }
            if header.eh_depth == 0 {
                for extent in leaf_entries(&node, &header)? {
                    let first = extent.ee_block as u64;
                    let len = extent.len() as u64;
                    if (first..first + len).contains(&lblock) {
                        return Ok(Some(extent.start() + (lblock - first)));
                    }
                }
                return Ok(None);
            }
            let indexes = index_entries(&node, &header)?;
            let child = indexes
                .iter()
                .take_while(|idx| idx.ei_block as u64 <= lblock)
                .last();
            let Some(child) = child else {
                return Ok(None);
            };
            depth_above = Some(header.eh_depth);
            node = self.read_extent_node(inode_num, inode.i_generation, child.leaf())?;
        }
    }

    /// Every physical run owned by the inode: data extents plus the blocks of
    /// any off-inode tree nodes.
    pub(crate) fn collect_extents(
        &mut self,
        inode_num: u32,
        inode: &Ext4Inode,
    ) -> Result<Vec<(u64, u64)>> {
        let mut runs = Vec::new();
        let mut pending: Vec<(Vec<u8>, Option<u16>)> = vec![(inode.i_block.to_vec(), None)];
        while let Some((node, depth_above)) = pending.pop() {
            let header = parse_header(&node)?;
            if let Some(above) = depth_above {
                if header.eh_depth + 1 != above {
                    return Err(Ext4Error::Corrupt(format!(
                        "extent node at depth {} under a node at depth {above}",
                        header.eh_depth
                    )));
                }
            }
            if header.eh_depth == 0 {
                for extent in leaf_entries(&node, &header)? {
                    runs.push((extent.start(), extent.len() as u64));
                }
            } else {
                for idx in index_entries(&node, &header)? {
                    runs.push((idx.leaf(), 1));
                    let child = self.read_extent_node(inode_num, inode.i_generation, idx.leaf())?;
                    pending.push((child, Some(header.eh_depth)));
                }
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with(extents: &[(u32, u64, u16)]) -> [u8; 60] {
        let mut i_block = [0u8; 60];
        init_root(&mut i_block);
        for &(logical, phys, len) in extents {
            append_to_root(&mut i_block, logical as u64, phys, len as u64).unwrap();
        }
        i_block
    }

    #[test]
    fn test_append_merges_adjacent_run() {
        let i_block = root_with(&[(0, 100, 2), (2, 102, 3)]);
        let header = parse_header(&i_block).unwrap();
        assert_eq!(header.eh_entries, 1);
        let entries = leaf_entries(&i_block, &header).unwrap();
        assert_eq!(entries[0].ee_block, 0);
        assert_eq!(entries[0].start(), 100);
        assert_eq!(entries[0].len(), 5);
    }

    #[test]
    fn test_append_keeps_discontiguous_runs_sorted() {
        let i_block = root_with(&[(4, 300, 1), (0, 100, 2)]);
        let header = parse_header(&i_block).unwrap();
        assert_eq!(header.eh_entries, 2);
        let entries = leaf_entries(&i_block, &header).unwrap();
        assert_eq!(entries[0].ee_block, 0);
        assert_eq!(entries[1].ee_block, 4);
    }

    #[test]
    fn test_append_overflow_is_file_too_large() {
        let mut i_block = root_with(&[(0, 10, 1), (2, 20, 1), (4, 30, 1), (6, 40, 1)]);
        let err = append_to_root(&mut i_block, 8, 50, 1).unwrap_err();
        assert!(matches!(err, Ext4Error::FileTooLarge));
    }

    #[test]
    fn test_merge_respects_sixteen_bit_len() {
        let mut i_block = [0u8; 60];
        init_root(&mut i_block);
        append_to_root(&mut i_block, 0, 1000, Ext4Extent::MAX_LEN as u64).unwrap();
        // physically adjacent but the merged length would overflow
        append_to_root(
            &mut i_block,
            Ext4Extent::MAX_LEN as u64,
            1000 + Ext4Extent::MAX_LEN as u64,
            1,
        )
        .unwrap();
        let header = parse_header(&i_block).unwrap();
        assert_eq!(header.eh_entries, 2);
    }

    #[test]
    fn test_parse_header_rejects_bad_magic() {
        let i_block = [0u8; 60];
        assert!(matches!(
            parse_header(&i_block),
            Err(Ext4Error::Corrupt(_))
        ));
    }
}
