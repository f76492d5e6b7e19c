//! Minimal mkfs: lays a fresh ext4 filesystem onto a device, with metadata
//! checksums, extents and 64-bit group descriptors, ready for in-place
//! editing. Backup superblocks are not written.

use log::debug;

use crate::checksum;
use crate::device::{ByteDevice, Volume};
use crate::dir;
use crate::error::{Ext4Error, Result};
use crate::ext4_h::{
    binwrite_as_buf, Ext4GroupDescriptor, Ext4Inode, Ext4SuperBlock, FileType, IncompatFeatures,
    RoCompatFeatures, StaticLenString, EXT4_MAGIC, FIRST_NON_RESERVED_INO, ROOT_INO,
    SUPERBLOCK_OFFSET, S_IFDIR,
};
use crate::{extent, unix_now};

pub struct FormatOptions {
    pub size_bytes: u64,
    /// 1024, 2048 or 4096.
    pub block_size: u64,
    pub uuid: [u8; 16],
    pub label: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            size_bytes: 64 * 1024 * 1024,
            block_size: 4096,
            uuid: [
                0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x12, 0x34, 0x56, 0x78, 0x9A,
                0xBC, 0xDE, 0xF0,
            ],
            label: String::new(),
        }
    }
}

struct GroupLayout {
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
}

fn mark_used(bitmaps: &mut [Vec<u8>], first_data_block: u64, blocks_per_group: u64, block: u64) {
    let group = ((block - first_data_block) / blocks_per_group) as usize;
    let bit = ((block - first_data_block) % blocks_per_group) as usize;
    bitmaps[group][bit / 8] |= 1 << (bit % 8);
}

fn encode_inode(inode: &Ext4Inode, num: u32, uuid: &[u8; 16]) -> Vec<u8> {
    let mut raw = binwrite_as_buf(inode).unwrap();
    let csum = checksum::inode_csum(uuid, num, inode.i_generation, &raw);
    raw[0x7C..0x7E].copy_from_slice(&(csum as u16).to_le_bytes());
    raw[0x82..0x84].copy_from_slice(&((csum >> 16) as u16).to_le_bytes());
    raw
}

fn directory_inode(data_block: u64, block_size: u64, links: u16, perm: u16, now: u32) -> Ext4Inode {
    let mut inode = Ext4Inode::default();
    inode.i_mode = S_IFDIR | perm;
    inode.i_links_count = links;
    inode.i_atime = now;
    inode.i_ctime = now;
    inode.i_mtime = now;
    inode.i_crtime = now;
    inode.i_extra_isize = 32;
    inode.i_flags = crate::ext4_h::INODE_FLAG_EXTENTS;
    inode.set_size(block_size);
    inode.set_blocks(block_size / 512);
    extent::init_root(&mut inode.i_block);
    extent::append_to_root(&mut inode.i_block, 0, data_block, 1).unwrap();
    inode
}

/// Write a fresh, empty ext4 volume onto `dev` and hand the device back.
///
/// The volume gets 256-byte inodes, 64-byte descriptors, a root directory and
/// `lost+found`, and the reserved inodes 1-10.
pub fn format<D: ByteDevice>(dev: D, opts: &FormatOptions) -> Result<D> {
    let bs = opts.block_size;
    if !matches!(bs, 1024 | 2048 | 4096) {
        return Err(Ext4Error::Unsupported(format!("block size {bs}")));
    }
    let blocks = opts.size_bytes / bs;
    let first_data_block: u64 = if bs == 1024 { 1 } else { 0 };
    let bpg = bs * 8;
    let ngroups = (blocks.saturating_sub(first_data_block)).div_ceil(bpg).max(1);

    // one inode per 16 KiB, padded to whole inode-table blocks and bitmap bytes
    let inodes_per_block = bs / Ext4Inode::SIZE;
    let align = inodes_per_block.max(8);
    let ipg = (opts.size_bytes / ngroups / 16384)
        .max(align)
        .max(16) // room for the reserved inodes
        .div_ceil(align)
        * align;
    let ipg = ipg.min(bpg);
    let itable_blocks = ipg * Ext4Inode::SIZE / bs;
    let gdt_blocks = (ngroups * 64).div_ceil(bs);

    let mut block_bitmaps: Vec<Vec<u8>> = (0..ngroups).map(|_| vec![0u8; bs as usize]).collect();
    let mut layouts = Vec::with_capacity(ngroups as usize);
    for g in 0..ngroups {
        let group_first = first_data_block + g * bpg;
        let mut cursor = group_first;
        if g == 0 {
            cursor += 1; // boot area and primary superblock
            cursor += gdt_blocks;
        }
        let block_bitmap = cursor;
        let inode_bitmap = cursor + 1;
        let inode_table = cursor + 2;
        cursor = inode_table + itable_blocks;
        if cursor > blocks || cursor > group_first + bpg {
            return Err(Ext4Error::Unsupported(
                "volume too small for its own metadata".into(),
            ));
        }
        for block in group_first..cursor {
            mark_used(&mut block_bitmaps, first_data_block, bpg, block);
        }
        layouts.push(GroupLayout {
            block_bitmap,
            inode_bitmap,
            inode_table,
        });
    }

    // the root and lost+found directories each take one data block in group 0
    let root_block = layouts[0].inode_table + itable_blocks;
    let lpf_block = root_block + 1;
    if lpf_block >= blocks.min(first_data_block + bpg) {
        return Err(Ext4Error::Unsupported(
            "volume too small for its own metadata".into(),
        ));
    }
    mark_used(&mut block_bitmaps, first_data_block, bpg, root_block);
    mark_used(&mut block_bitmaps, first_data_block, bpg, lpf_block);

    // bits past the end of the volume are permanently taken
    let last_first = first_data_block + (ngroups - 1) * bpg;
    for bit in (blocks - last_first)..bpg {
        let bitmap = &mut block_bitmaps[(ngroups - 1) as usize];
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    let mut inode_bitmaps: Vec<Vec<u8>> = (0..ngroups).map(|_| vec![0u8; bs as usize]).collect();
    for bitmap in inode_bitmaps.iter_mut() {
        for bit in ipg..bpg {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }
    for ino in 1..=FIRST_NON_RESERVED_INO {
        let bit = (ino - 1) as usize;
        inode_bitmaps[0][bit / 8] |= 1 << (bit % 8);
    }

    let now = unix_now();
    let mut vol = Volume::new(dev, 0);
    // reach the end once so short backing stores grow to the full size
    vol.write_at(opts.size_bytes - 1, &[0u8])?;
    vol.write_at(0, &[0u8; 1024])?;

    // inode tables: zeroed, with the reserved inodes of group 0 carrying
    // valid checksums
    let mut itable0 = vec![0u8; (itable_blocks * bs) as usize];
    for ino in 1..=FIRST_NON_RESERVED_INO {
        let mut inode = Ext4Inode::default();
        inode.i_extra_isize = 32;
        match ino {
            1 => inode.i_links_count = 1, // bad blocks inode
            ROOT_INO => inode = directory_inode(root_block, bs, 3, 0o755, now),
            FIRST_NON_RESERVED_INO => inode = directory_inode(lpf_block, bs, 2, 0o700, now),
            _ => {}
        }
        let raw = encode_inode(&inode, ino, &opts.uuid);
        let at = ((ino - 1) as u64 * Ext4Inode::SIZE) as usize;
        itable0[at..at + raw.len()].copy_from_slice(&raw);
    }

    let empty_itable = vec![0u8; (itable_blocks * bs) as usize];
    for (g, layout) in layouts.iter().enumerate() {
        vol.write_at(layout.block_bitmap * bs, &block_bitmaps[g])?;
        vol.write_at(layout.inode_bitmap * bs, &inode_bitmaps[g])?;
        let table = if g == 0 { &itable0 } else { &empty_itable };
        vol.write_at(layout.inode_table * bs, table)?;
    }

    let root_dir = dir::build_dir_block(
        bs as usize,
        true,
        &opts.uuid,
        ROOT_INO,
        0,
        &[
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (FIRST_NON_RESERVED_INO, FileType::Directory, "lost+found"),
        ],
    );
    vol.write_at(root_block * bs, &root_dir)?;
    let lpf_dir = dir::build_dir_block(
        bs as usize,
        true,
        &opts.uuid,
        FIRST_NON_RESERVED_INO,
        0,
        &[
            (FIRST_NON_RESERVED_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
        ],
    );
    vol.write_at(lpf_block * bs, &lpf_dir)?;

    // group descriptor table
    let mut free_blocks_total = 0u64;
    let mut gdt = vec![0u8; (gdt_blocks * bs) as usize];
    for (g, layout) in layouts.iter().enumerate() {
        let free = block_bitmaps[g]
            .iter()
            .map(|b| b.count_zeros() as u64)
            .sum::<u64>();
        free_blocks_total += free;

        let mut desc = Ext4GroupDescriptor::default();
        desc.set_block_bitmap(layout.block_bitmap);
        desc.set_inode_bitmap(layout.inode_bitmap);
        desc.set_inode_table(layout.inode_table);
        desc.set_free_blocks_count(free as u32);
        desc.set_free_inodes_count(if g == 0 {
            (ipg - FIRST_NON_RESERVED_INO as u64) as u32
        } else {
            ipg as u32
        });
        desc.set_used_dirs_count(if g == 0 { 2 } else { 0 });
        let bcsum = checksum::bitmap_csum(&opts.uuid, &block_bitmaps[g][..(bpg / 8) as usize]);
        desc.set_block_bitmap_csum(bcsum, 64);
        let icsum =
            checksum::bitmap_csum(&opts.uuid, &inode_bitmaps[g][..ipg.div_ceil(8) as usize]);
        desc.set_inode_bitmap_csum(icsum, 64);
        desc.update_checksum(&opts.uuid, g as u64, 64);

        let raw = binwrite_as_buf(&desc)?;
        gdt[g * 64..g * 64 + 64].copy_from_slice(&raw);
    }
    vol.write_at((first_data_block + 1) * bs, &gdt)?;

    // finally the superblock
    let mut sb = Ext4SuperBlock::default();
    sb.s_magic = EXT4_MAGIC;
    sb.s_inodes_count = (ngroups * ipg) as u32;
    sb.set_blocks_count(blocks);
    sb.set_free_blocks_count(free_blocks_total);
    sb.s_free_inodes_count = (ngroups * ipg - FIRST_NON_RESERVED_INO as u64) as u32;
    sb.s_first_data_block = first_data_block as u32;
    sb.s_log_block_size = bs.trailing_zeros() - 10;
    sb.s_log_cluster_size = sb.s_log_block_size;
    sb.s_blocks_per_group = bpg as u32;
    sb.s_clusters_per_group = bpg as u32;
    sb.s_inodes_per_group = ipg as u32;
    sb.s_wtime = now;
    sb.s_mkfs_time = now;
    sb.s_max_mnt_count = 0xFFFF;
    sb.s_state = 1;
    sb.s_errors = 1;
    sb.s_rev_level = 1;
    sb.s_first_ino = FIRST_NON_RESERVED_INO;
    sb.s_inode_size = Ext4Inode::SIZE as u16;
    sb.s_feature_incompat =
        (IncompatFeatures::FILETYPE | IncompatFeatures::EXTENTS | IncompatFeatures::BIT64).bits();
    sb.s_feature_ro_compat = (RoCompatFeatures::SPARSE_SUPER
        | RoCompatFeatures::LARGE_FILE
        | RoCompatFeatures::HUGE_FILE
        | RoCompatFeatures::DIR_NLINK
        | RoCompatFeatures::EXTRA_ISIZE
        | RoCompatFeatures::METADATA_CSUM)
        .bits();
    sb.s_uuid = opts.uuid;
    sb.s_volume_name = StaticLenString::from_str(&opts.label);
    sb.s_desc_size = 64;
    sb.s_min_extra_isize = 32;
    sb.s_want_extra_isize = 32;
    sb.s_checksum_type = 1;
    sb.s_lpf_ino = FIRST_NON_RESERVED_INO;

    let mut raw = binwrite_as_buf(&sb)?;
    let csum = checksum::superblock_csum(&raw);
    raw[0x3FC..0x400].copy_from_slice(&csum.to_le_bytes());
    vol.write_at(SUPERBLOCK_OFFSET, &raw)?;

    debug!(
        "formatted {} blocks of {bs} bytes in {ngroups} group(s), {ipg} inodes per group",
        blocks
    );
    Ok(vol.into_inner())
}
