//! Linear directories: packed variable-length entries per data block, closed
//! by a checksum tail when metadata checksums are on.

use log::debug;

use crate::checksum;
use crate::device::ByteDevice;
use crate::error::{Ext4Error, Result};
use crate::ext4_h::{
    binread_from_buf, binwrite_as_buf, Ext4DirEntryTail, Ext4Inode, FileType, DIRENT_TAIL_FTYPE,
};
use crate::{unix_now, Ext4Fs};

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: String,
}

/// Bytes an entry actually occupies: 8-byte header plus the name, 4-aligned.
fn used_len(name_len: usize) -> usize {
    (8 + name_len + 3) & !3
}

fn parse_entry_header(block: &[u8], off: usize) -> (u32, usize, usize, u8) {
    let inode = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
    let rec_len = u16::from_le_bytes(block[off + 4..off + 6].try_into().unwrap()) as usize;
    let name_len = block[off + 6] as usize;
    let file_type = block[off + 7];
    (inode, rec_len, name_len, file_type)
}

fn write_entry(block: &mut [u8], off: usize, inode: u32, rec_len: u16, ftype: u8, name: &str) {
    block[off..off + 4].copy_from_slice(&inode.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = ftype;
    let used = used_len(name.len());
    block[off + 8..off + used].fill(0);
    block[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
}

fn has_tail(block: &[u8]) -> bool {
    let tail: Ext4DirEntryTail =
        binread_from_buf(&block[block.len() - Ext4DirEntryTail::SIZE..]).unwrap();
    tail.looks_like_tail()
}

fn stored_tail_csum(block: &[u8]) -> u32 {
    let tail: Ext4DirEntryTail =
        binread_from_buf(&block[block.len() - Ext4DirEntryTail::SIZE..]).unwrap();
    tail.det_checksum
}

fn set_tail(block: &mut [u8], uuid: &[u8; 16], dir_num: u32, generation: u32) {
    let csum = checksum::dir_block_csum(uuid, dir_num, generation, block);
    let tail = binwrite_as_buf(&Ext4DirEntryTail::new(csum)).unwrap();
    let at = block.len() - Ext4DirEntryTail::SIZE;
    block[at..].copy_from_slice(&tail);
}

/// Pack a fresh directory block. The final entry's `rec_len` is stretched to
/// the end of the usable area; the 12-byte tail follows when checksums are on.
pub(crate) fn build_dir_block(
    block_size: usize,
    with_tail: bool,
    uuid: &[u8; 16],
    dir_num: u32,
    generation: u32,
    entries: &[(u32, FileType, &str)],
) -> Vec<u8> {
    let usable = block_size - if with_tail { Ext4DirEntryTail::SIZE } else { 0 };
    let mut block = vec![0u8; block_size];
    let mut off = 0;
    for (i, &(inode, ftype, name)) in entries.iter().enumerate() {
        let rec_len = if i == entries.len() - 1 {
            usable - off
        } else {
            used_len(name.len())
        };
        write_entry(&mut block, off, inode, rec_len as u16, ftype.as_dirent_code(), name);
        off += rec_len;
    }
    if with_tail {
        set_tail(&mut block, uuid, dir_num, generation);
    }
    block
}

impl<D: ByteDevice> Ext4Fs<D> {
    fn read_dir_block(
        &mut self,
        dir_num: u32,
        inode: &Ext4Inode,
        lblock: u64,
    ) -> Result<(u64, Vec<u8>)> {
        let bs = self.block_size();
        let phys = self
            .map_file_block(dir_num, inode, lblock)?
            .ok_or_else(|| Ext4Error::Corrupt(format!("hole in directory inode {dir_num}")))?;
        let mut block = vec![0u8; bs as usize];
        self.vol.read_at(phys * bs, &mut block)?;
        if self.sb.has_metadata_csum() && has_tail(&block) {
            let computed =
                checksum::dir_block_csum(self.sb.uuid(), dir_num, inode.i_generation, &block);
            if computed != stored_tail_csum(&block) {
                return Err(Ext4Error::ChecksumMismatch {
                    object: "directory block",
                    index: phys,
                });
            }
        }
        Ok((phys, block))
    }

    /// All real entries of a directory, in block order. The tail fake entry
    /// and empty slots are filtered out.
    pub(crate) fn dir_entries(&mut self, dir_num: u32, inode: &Ext4Inode) -> Result<Vec<DirEntry>> {
        let bs = self.block_size();
        let mut entries = Vec::new();
        for lblock in 0..inode.size() / bs {
            let (phys, block) = self.read_dir_block(dir_num, inode, lblock)?;
            let mut off = 0;
            while off + 8 <= block.len() {
                let (inode_num, rec_len, name_len, file_type) = parse_entry_header(&block, off);
                if rec_len < 8 || off + rec_len > block.len() || off + 8 + name_len > block.len() {
                    return Err(Ext4Error::Corrupt(format!(
                        "directory entry at block {phys} offset {off}"
                    )));
                }
                if inode_num != 0 && file_type != DIRENT_TAIL_FTYPE {
                    let name = String::from_utf8_lossy(&block[off + 8..off + 8 + name_len]);
                    entries.push(DirEntry {
                        inode: inode_num,
                        file_type,
                        name: name.into_owned(),
                    });
                }
                off += rec_len;
            }
        }
        Ok(entries)
    }

    /// Link `child` under the directory as `name`, splitting the last entry of
    /// the last block or appending a fresh block when nothing fits.
    pub(crate) fn dir_add_entry(
        &mut self,
        dir_num: u32,
        name: &str,
        child: u32,
        ftype: FileType,
    ) -> Result<()> {
        if name.len() > 255 {
            return Err(Ext4Error::Corrupt(format!(
                "directory entry name longer than 255 bytes: {name}"
            )));
        }
        let mut inode = self.read_inode(dir_num)?;
        if inode.is_htree_dir() {
            return Err(Ext4Error::Unsupported(format!(
                "adding entries to hash-tree directory inode {dir_num}"
            )));
        }
        debug!("linking inode {child} as '{name}' under directory inode {dir_num}");

        let bs = self.block_size();
        let need = used_len(name.len());
        let nblocks = inode.size() / bs;
        if nblocks > 0
            && self.try_add_in_last_block(dir_num, &inode, nblocks - 1, name, child, ftype, need)?
        {
            inode.i_mtime = unix_now();
            inode.i_ctime = inode.i_mtime;
            self.write_inode(dir_num, &mut inode)?;
            return Ok(());
        }

        // no room anywhere: give the directory one more block
        let (block, got) = self.get_free_blocks(1)?;
        debug_assert_eq!(got, 1);
        let with_tail = self.sb.has_metadata_csum();
        let fresh = build_dir_block(
            bs as usize,
            with_tail,
            self.sb.uuid(),
            dir_num,
            inode.i_generation,
            &[(child, ftype, name)],
        );
        self.vol.write_at(block * bs, &fresh)?;
        crate::extent::append_to_root(&mut inode.i_block, nblocks, block, 1)?;
        inode.set_size(inode.size() + bs);
        inode.set_blocks(inode.blocks() + bs / 512);
        inode.i_mtime = unix_now();
        inode.i_ctime = inode.i_mtime;
        self.write_inode(dir_num, &mut inode)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn try_add_in_last_block(
        &mut self,
        dir_num: u32,
        inode: &Ext4Inode,
        lblock: u64,
        name: &str,
        child: u32,
        ftype: FileType,
        need: usize,
    ) -> Result<bool> {
        let bs = self.block_size();
        let (phys, mut block) = self.read_dir_block(dir_num, inode, lblock)?;
        let with_tail = self.sb.has_metadata_csum() && has_tail(&block);
        let usable = block.len() - if with_tail { Ext4DirEntryTail::SIZE } else { 0 };

        // find the entry whose rec_len runs to the end of the usable area
        let mut off = 0;
        let (last_off, last_inode, last_rec_len, last_name_len) = loop {
            let (inode_num, rec_len, name_len, _) = parse_entry_header(&block, off);
            if rec_len < 8 || off + rec_len > usable {
                return Err(Ext4Error::Corrupt(format!(
                    "directory entry at block {phys} offset {off}"
                )));
            }
            if off + rec_len == usable {
                break (off, inode_num, rec_len, name_len);
            }
            off += rec_len;
        };

        let last_used = if last_inode != 0 {
            used_len(last_name_len)
        } else {
            0
        };
        if last_used > last_rec_len {
            return Err(Ext4Error::Corrupt(format!(
                "directory entry at block {phys} offset {last_off}"
            )));
        }
        if last_rec_len - last_used < need {
            return Ok(false);
        }

        let new_off = last_off + last_used;
        if last_inode != 0 {
            block[last_off + 4..last_off + 6].copy_from_slice(&(last_used as u16).to_le_bytes());
        }
        write_entry(
            &mut block,
            new_off,
            child,
            (usable - new_off) as u16,
            ftype.as_dirent_code(),
            name,
        );
        if with_tail {
            set_tail(&mut block, self.sb.uuid(), dir_num, inode.i_generation);
        }
        self.vol.write_at(phys * bs, &block)?;
        Ok(true)
    }

    /// Unlink `name` from the directory: merge its record into the preceding
    /// entry, or blank the inode field when it leads its block.
    pub(crate) fn dir_remove_entry(&mut self, dir_num: u32, name: &str) -> Result<()> {
        let mut inode = self.read_inode(dir_num)?;
        if inode.is_htree_dir() {
            return Err(Ext4Error::Unsupported(format!(
                "removing entries from hash-tree directory inode {dir_num}"
            )));
        }
        let bs = self.block_size();
        for lblock in 0..inode.size() / bs {
            let (phys, mut block) = self.read_dir_block(dir_num, &inode, lblock)?;
            let mut off = 0;
            let mut prev: Option<usize> = None;
            while off + 8 <= block.len() {
                let (inode_num, rec_len, name_len, file_type) = parse_entry_header(&block, off);
                if rec_len < 8 || off + rec_len > block.len() || off + 8 + name_len > block.len() {
                    return Err(Ext4Error::Corrupt(format!(
                        "directory entry at block {phys} offset {off}"
                    )));
                }
                let matches = inode_num != 0
                    && file_type != DIRENT_TAIL_FTYPE
                    && &block[off + 8..off + 8 + name_len] == name.as_bytes();
                if matches {
                    if let Some(prev_off) = prev {
                        let (_, prev_rec_len, _, _) = parse_entry_header(&block, prev_off);
                        let merged = (prev_rec_len + rec_len) as u16;
                        block[prev_off + 4..prev_off + 6].copy_from_slice(&merged.to_le_bytes());
                    } else {
                        block[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                    }
                    if self.sb.has_metadata_csum() && has_tail(&block) {
                        set_tail(&mut block, self.sb.uuid(), dir_num, inode.i_generation);
                    }
                    self.vol.write_at(phys * bs, &block)?;
                    inode.i_mtime = unix_now();
                    inode.i_ctime = inode.i_mtime;
                    self.write_inode(dir_num, &mut inode)?;
                    debug!("unlinked '{name}' from directory inode {dir_num}");
                    return Ok(());
                }
                if file_type != DIRENT_TAIL_FTYPE {
                    prev = Some(off);
                }
                off += rec_len;
            }
        }
        Err(Ext4Error::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_len_is_four_aligned() {
        assert_eq!(used_len(1), 12);
        assert_eq!(used_len(2), 12);
        assert_eq!(used_len(4), 12);
        assert_eq!(used_len(5), 16);
        assert_eq!(used_len(11), 20);
    }

    #[test]
    fn test_build_dir_block_new_directory_layout() {
        let uuid = [1u8; 16];
        let entries = [
            (12u32, FileType::Directory, "."),
            (2u32, FileType::Directory, ".."),
        ];
        let block = build_dir_block(1024, true, &uuid, 12, 0, &entries);

        let (inode, rec_len, name_len, ftype) = parse_entry_header(&block, 0);
        assert_eq!((inode, rec_len, name_len, ftype), (12, 12, 1, 2));
        assert_eq!(&block[8..9], b".");

        let (inode, rec_len, name_len, _) = parse_entry_header(&block, 12);
        assert_eq!((inode, rec_len, name_len), (2, 1024 - 12 - 12, 2));
        assert_eq!(&block[20..22], b"..");

        assert!(has_tail(&block));
        assert_eq!(
            stored_tail_csum(&block),
            checksum::dir_block_csum(&uuid, 12, 0, &block)
        );
    }

    #[test]
    fn test_build_dir_block_rec_lens_cover_block() {
        let uuid = [1u8; 16];
        let entries = [
            (2u32, FileType::Directory, "."),
            (2u32, FileType::Directory, ".."),
            (11u32, FileType::Directory, "lost+found"),
        ];
        let block = build_dir_block(4096, true, &uuid, 2, 0, &entries);
        let mut off = 0;
        while off < block.len() {
            let (_, rec_len, _, _) = parse_entry_header(&block, off);
            off += rec_len;
        }
        // entries plus the 12-byte tail tile the block exactly
        assert_eq!(off, 4096);
    }

    #[test]
    fn test_build_dir_block_without_tail_spans_whole_block() {
        let entries = [(7u32, FileType::RegularFile, "a.txt")];
        let block = build_dir_block(1024, false, &[0u8; 16], 2, 0, &entries);
        let (inode, rec_len, _, ftype) = parse_entry_header(&block, 0);
        assert_eq!((inode, rec_len, ftype), (7, 1024, 1));
    }
}
