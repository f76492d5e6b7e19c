//! On-disk ext4 structures, laid out field for field as in the kernel's
//! `fs/ext4/ext4.h`. All structures decode from and encode to little-endian
//! buffers; positioned device I/O happens elsewhere.

use binrw::{BinRead, BinResult, BinWrite};
use bitflags::bitflags;
use std::fmt::Debug;
use std::io::Cursor;

use crate::checksum;

pub const EXT4_MAGIC: u16 = 0xEF53;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const ROOT_INO: u32 = 2;
pub const FIRST_NON_RESERVED_INO: u32 = 11;
pub const EXTENT_MAGIC: u16 = 0xF30A;
/// `file_type` of the fake tail entry closing a checksummed directory block.
pub const DIRENT_TAIL_FTYPE: u8 = 0xDE;

pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE    = 0x0002;
        const RECOVER     = 0x0004; /* Needs recovery */
        const JOURNAL_DEV = 0x0008; /* Journal device */
        const META_BG     = 0x0010;
        const EXTENTS     = 0x0040; /* extents support */
        const BIT64       = 0x0080;
        const MMP         = 0x0100;
        const FLEX_BG     = 0x0200;
        const EA_INODE    = 0x0400; /* EA in inode */
        const DIRDATA     = 0x1000; /* data in dirent */
        const CSUM_SEED   = 0x2000;
        const LARGEDIR    = 0x4000; /* >2GB or 3-lvl htree */
        const INLINE_DATA = 0x8000; /* data in inode */
        const ENCRYPT     = 0x10000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER  = 0x0001;
        const LARGE_FILE    = 0x0002;
        const HUGE_FILE     = 0x0008;
        const GDT_CSUM      = 0x0010;
        const DIR_NLINK     = 0x0020;
        const EXTRA_ISIZE   = 0x0040;
        const QUOTA         = 0x0100;
        const BIGALLOC      = 0x0200;
        const METADATA_CSUM = 0x0400;
        const PROJECT       = 0x2000;
    }
}

/// Inode flag: file content is mapped by an extent tree.
pub const INODE_FLAG_EXTENTS: u32 = 0x0008_0000;
/// Inode flag: hash-indexed directory.
pub const INODE_FLAG_INDEX: u32 = 0x0000_1000;

/// `file_type` codes carried in directory entries (FILETYPE feature).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile = 1,
    Directory = 2,
}

impl FileType {
    pub fn as_dirent_code(self) -> u8 {
        self as u8
    }
}

#[derive(BinRead, BinWrite, Clone, PartialEq, Eq)]
pub struct StaticLenString<const N: usize> {
    pub data: [u8; N],
}
impl<const N: usize> StaticLenString<N> {
    pub fn from_str(s: &str) -> Self {
        let mut data = [0u8; N];
        let bytes = s.as_bytes();
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        StaticLenString { data }
    }

    pub fn as_str(&self) -> &str {
        let len = self
            .data
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..len]).unwrap_or("")
    }
}
impl<const N: usize> Default for StaticLenString<N> {
    fn default() -> Self {
        StaticLenString { data: [0u8; N] }
    }
}
impl<const N: usize> Debug for StaticLenString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StaticLenString::from_str(\"{}\")", self.as_str())
    }
}

pub fn binwrite_as_buf<T: BinWrite>(value: &T) -> BinResult<Vec<u8>>
where
    for<'a> <T as BinWrite>::Args<'a>: Default,
{
    let mut buf = Cursor::new(Vec::new());
    value.write_le(&mut buf)?;
    Ok(buf.into_inner())
}

pub fn binread_from_buf<T: BinRead>(buf: &[u8]) -> BinResult<T>
where
    for<'a> <T as BinRead>::Args<'a>: Default,
{
    T::read_le(&mut Cursor::new(buf))
}

macro_rules! lo_hi_u64 {
    ($get_name:ident, $set_name:ident, $lo:ident, $hi:ident) => {
        pub fn $get_name(&self) -> u64 {
            ((self.$hi as u64) << 32) | (self.$lo as u64)
        }
        pub fn $set_name(&mut self, value: u64) {
            self.$lo = value as u32;
            self.$hi = (value >> 32) as u32;
        }
    };
}

macro_rules! lo16_hi16_u32 {
    ($get_name:ident, $set_name:ident, $lo:ident, $hi:ident) => {
        pub fn $get_name(&self) -> u32 {
            ((self.$hi as u32) << 16) | (self.$lo as u32)
        }
        pub fn $set_name(&mut self, value: u32) {
            self.$hi = (value >> 16) as u16;
            self.$lo = value as u16;
        }
    };
}

#[derive(Debug, BinRead, BinWrite, Default, Clone, PartialEq)]
pub struct Ext4SuperBlock {
    /*00*/ pub s_inodes_count: u32, /* Inodes count */
    s_blocks_count_lo: u32,      /* Blocks count */
    s_r_blocks_count_lo: u32,    /* Reserved blocks count */
    s_free_blocks_count_lo: u32, /* Free blocks count */
    /*10*/ pub s_free_inodes_count: u32, /* Free inodes count */
    pub s_first_data_block: u32, /* First Data Block */
    pub s_log_block_size: u32,   /* Block size */
    pub s_log_cluster_size: u32, /* Allocation cluster size */
    /*20*/ pub s_blocks_per_group: u32, /* # Blocks per group */
    pub s_clusters_per_group: u32, /* # Clusters per group */
    pub s_inodes_per_group: u32, /* # Inodes per group */
    pub s_mtime: u32,            /* Mount time */
    /*30*/ pub s_wtime: u32, /* Write time */
    pub s_mnt_count: u16,       /* Mount count */
    pub s_max_mnt_count: u16,   /* Maximal mount count */
    pub s_magic: u16,           /* Magic signature */
    pub s_state: u16,           /* File system state */
    pub s_errors: u16,          /* Behaviour when detecting errors */
    pub s_minor_rev_level: u16, /* minor revision level */
    /*40*/ pub s_lastcheck: u32, /* time of last check */
    pub s_checkinterval: u32, /* max. time between checks */
    pub s_creator_os: u32,    /* OS */
    pub s_rev_level: u32,     /* Revision level */
    /*50*/ pub s_def_resuid: u16, /* Default uid for reserved blocks */
    pub s_def_resgid: u16, /* Default gid for reserved blocks */
    pub s_first_ino: u32,  /* First non-reserved inode */
    pub s_inode_size: u16, /* size of inode structure */
    pub s_block_group_nr: u16, /* block group # of this superblock */
    pub s_feature_compat: u32, /* compatible feature set */
    /*60*/ pub s_feature_incompat: u32, /* incompatible feature set */
    pub s_feature_ro_compat: u32, /* readonly-compatible feature set */
    /*68*/ pub s_uuid: [u8; 16], /* 128-bit uuid for volume */
    /*78*/ pub s_volume_name: StaticLenString<16>, /* volume name */
    /*88*/ pub s_last_mounted: StaticLenString<64>, /* directory where last mounted */
    /*C8*/ pub s_algorithm_usage_bitmap: u32, /* For compression */
    pub s_prealloc_blocks: u8,      /* Nr of blocks to try to preallocate*/
    pub s_prealloc_dir_blocks: u8,  /* Nr to preallocate for dirs */
    pub s_reserved_gdt_blocks: u16, /* Per group desc for online growth */
    /*D0*/ pub s_journal_uuid: [u8; 16], /* uuid of journal superblock */
    /*E0*/ pub s_journal_inum: u32, /* inode number of journal file */
    pub s_journal_dev: u32,     /* device number of journal file */
    pub s_last_orphan: u32,     /* start of list of inodes to delete */
    pub s_hash_seed: [u32; 4],  /* HTREE hash seed */
    pub s_def_hash_version: u8, /* Default hash version to use */
    pub s_jnl_backup_type: u8,
    pub s_desc_size: u16, /* size of group descriptor */
    /*100*/ pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32,    /* First metablock block group */
    pub s_mkfs_time: u32,        /* When the filesystem was created */
    pub s_jnl_blocks: [u32; 17], /* Backup of the journal inode */
    /*150*/ s_blocks_count_hi: u32, /* Blocks count */
    s_r_blocks_count_hi: u32,    /* Reserved blocks count */
    s_free_blocks_count_hi: u32, /* Free blocks count */
    pub s_min_extra_isize: u16,  /* All inodes have at least # bytes */
    pub s_want_extra_isize: u16, /* New inodes should reserve # bytes */
    pub s_flags: u32,            /* Miscellaneous flags */
    pub s_raid_stride: u16,      /* RAID stride */
    pub s_mmp_update_interval: u16, /* # seconds to wait in MMP checking */
    pub s_mmp_block: u64,        /* Block for multi-mount protection */
    pub s_raid_stripe_width: u32, /* blocks on all data disks (N*stride)*/
    pub s_log_groups_per_flex: u8, /* FLEX_BG group size */
    pub s_checksum_type: u8,     /* metadata checksum algorithm used */
    pub s_encryption_level: u8,  /* versioning level for encryption */
    pub s_reserved_pad: u8,      /* Padding to next 32bits */
    pub s_kbytes_written: u64,   /* nr of lifetime kilobytes written */
    pub s_snapshot_inum: u32,    /* Inode number of active snapshot */
    pub s_snapshot_id: u32,      /* sequential ID of active snapshot */
    pub s_snapshot_r_blocks_count: u64,
    pub s_snapshot_list: u32, /* inode number of the head of the snapshot list */
    pub s_error_count: u32,   /* number of fs errors */
    pub s_first_error_time: u32, /* first time an error happened */
    pub s_first_error_ino: u32, /* inode involved in first error */
    pub s_first_error_block: u64, /* block involved of first error */
    pub s_first_error_func: StaticLenString<32>, /* function where the error happened */
    pub s_first_error_line: u32, /* line number where error happened */
    pub s_last_error_time: u32, /* most recent time of an error */
    pub s_last_error_ino: u32, /* inode involved in last error */
    pub s_last_error_line: u32, /* line number where error happened */
    pub s_last_error_block: u64, /* block involved of last error */
    pub s_last_error_func: StaticLenString<32>, /* function where the error happened */
    /*200*/ pub s_mount_opts: StaticLenString<64>,
    pub s_usr_quota_inum: u32,   /* inode for tracking user quota */
    pub s_grp_quota_inum: u32,   /* inode for tracking group quota */
    pub s_overhead_clusters: u32, /* overhead blocks/clusters in fs */
    pub s_backup_bgs: [u32; 2],  /* groups with sparse_super2 SBs */
    pub s_encrypt_algos: [u8; 4], /* Encryption algorithms in use  */
    pub s_encrypt_pw_salt: [u8; 16], /* Salt used for string2key algorithm */
    pub s_lpf_ino: u32,          /* Location of the lost+found inode */
    pub s_prj_quota_inum: u32,   /* inode for tracking project quota */
    pub s_checksum_seed: u32,    /* crc32c(uuid) if csum_seed set */
    pub s_wtime_hi: u8,
    pub s_mtime_hi: u8,
    pub s_mkfs_time_hi: u8,
    pub s_lastcheck_hi: u8,
    pub s_first_error_time_hi: u8,
    pub s_last_error_time_hi: u8,
    pub s_first_error_errcode: u8,
    pub s_last_error_errcode: u8,
    pub s_encoding: u16,       /* Filename charset encoding */
    pub s_encoding_flags: u16, /* Filename charset encoding flags */
    pub s_orphan_file_inum: u32, /* Inode for tracking orphan inodes */
    pub s_reserved: StaticLenString<376>, /* Padding to the end of the block */
    pub s_checksum: u32, /* crc32c(superblock) */
}

impl Ext4SuperBlock {
    lo_hi_u64!(
        blocks_count,
        set_blocks_count,
        s_blocks_count_lo,
        s_blocks_count_hi
    );
    lo_hi_u64!(
        free_blocks_count,
        set_free_blocks_count,
        s_free_blocks_count_lo,
        s_free_blocks_count_hi
    );

    pub fn block_size(&self) -> u64 {
        1u64 << (10 + self.s_log_block_size)
    }

    pub fn block_groups_count(&self) -> u64 {
        let data_blocks = self.blocks_count() - self.s_first_data_block as u64;
        data_blocks.div_ceil(self.s_blocks_per_group as u64)
    }

    pub fn incompat(&self) -> IncompatFeatures {
        IncompatFeatures::from_bits_retain(self.s_feature_incompat)
    }

    pub fn ro_compat(&self) -> RoCompatFeatures {
        RoCompatFeatures::from_bits_retain(self.s_feature_ro_compat)
    }

    pub fn has_64bit(&self) -> bool {
        self.incompat().contains(IncompatFeatures::BIT64)
    }

    pub fn has_metadata_csum(&self) -> bool {
        self.ro_compat().contains(RoCompatFeatures::METADATA_CSUM)
    }

    /// 32 by default, 64 once the 64-bit feature is on.
    pub fn desc_size(&self) -> u64 {
        if self.has_64bit() {
            if self.s_desc_size >= 64 {
                self.s_desc_size as u64
            } else {
                64
            }
        } else {
            32
        }
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.s_uuid
    }

    pub fn label(&self) -> &str {
        self.s_volume_name.as_str()
    }

    /// Byte offset of the group descriptor table inside the volume.
    pub fn gdt_offset(&self) -> u64 {
        (1024 / self.block_size() + 1) * self.block_size()
    }
}

#[derive(Debug, BinRead, BinWrite, Default, Clone, PartialEq, Eq)]
pub struct Ext4GroupDescriptor {
    bg_block_bitmap_lo: u32,      /* Blocks bitmap block */
    bg_inode_bitmap_lo: u32,      /* Inodes bitmap block */
    bg_inode_table_lo: u32,       /* Inodes table block */
    bg_free_blocks_count_lo: u16, /* Free blocks count */
    bg_free_inodes_count_lo: u16, /* Free inodes count */
    bg_used_dirs_count_lo: u16,   /* Directories count */
    pub bg_flags: u16,            /* EXT4_BG_flags (INODE_UNINIT, etc) */
    pub bg_exclude_bitmap_lo: u32, /* Exclude bitmap for snapshots */
    bg_block_bitmap_csum_lo: u16, /* crc32c(s_uuid+grp_num+bbitmap) LE */
    bg_inode_bitmap_csum_lo: u16, /* crc32c(s_uuid+grp_num+ibitmap) LE */
    pub bg_itable_unused_lo: u16, /* Unused inodes count */
    pub bg_checksum: u16,         /* crc16(sb_uuid+group+desc) */
    bg_block_bitmap_hi: u32,      /* Blocks bitmap block MSB */
    bg_inode_bitmap_hi: u32,      /* Inodes bitmap block MSB */
    bg_inode_table_hi: u32,       /* Inodes table block MSB */
    bg_free_blocks_count_hi: u16, /* Free blocks count MSB */
    bg_free_inodes_count_hi: u16, /* Free inodes count MSB */
    bg_used_dirs_count_hi: u16,   /* Directories count MSB */
    pub bg_itable_unused_hi: u16, /* Unused inodes count MSB */
    pub bg_exclude_bitmap_hi: u32, /* Exclude bitmap block MSB */
    bg_block_bitmap_csum_hi: u16, /* crc32c(s_uuid+grp_num+bbitmap) BE */
    bg_inode_bitmap_csum_hi: u16, /* crc32c(s_uuid+grp_num+ibitmap) BE */
    pub bg_reserved: u32,
}

impl Ext4GroupDescriptor {
    lo_hi_u64!(
        block_bitmap,
        set_block_bitmap,
        bg_block_bitmap_lo,
        bg_block_bitmap_hi
    );
    lo_hi_u64!(
        inode_bitmap,
        set_inode_bitmap,
        bg_inode_bitmap_lo,
        bg_inode_bitmap_hi
    );
    lo_hi_u64!(
        inode_table,
        set_inode_table,
        bg_inode_table_lo,
        bg_inode_table_hi
    );
    lo16_hi16_u32!(
        free_blocks_count,
        set_free_blocks_count,
        bg_free_blocks_count_lo,
        bg_free_blocks_count_hi
    );
    lo16_hi16_u32!(
        free_inodes_count,
        set_free_inodes_count,
        bg_free_inodes_count_lo,
        bg_free_inodes_count_hi
    );
    lo16_hi16_u32!(
        used_dirs_count,
        set_used_dirs_count,
        bg_used_dirs_count_lo,
        bg_used_dirs_count_hi
    );
    lo16_hi16_u32!(
        itable_unused,
        set_itable_unused,
        bg_itable_unused_lo,
        bg_itable_unused_hi
    );

    pub fn set_block_bitmap_csum(&mut self, csum: u32, desc_size: u64) {
        self.bg_block_bitmap_csum_lo = csum as u16;
        if desc_size >= 64 {
            self.bg_block_bitmap_csum_hi = (csum >> 16) as u16;
        }
    }

    pub fn set_inode_bitmap_csum(&mut self, csum: u32, desc_size: u64) {
        self.bg_inode_bitmap_csum_lo = csum as u16;
        if desc_size >= 64 {
            self.bg_inode_bitmap_csum_hi = (csum >> 16) as u16;
        }
    }

    /// Refresh `bg_checksum` over `desc_size` bytes of this descriptor.
    pub fn update_checksum(&mut self, uuid: &[u8; 16], group_num: u64, desc_size: u64) {
        self.bg_checksum = 0;
        let bytes = binwrite_as_buf(self).unwrap();
        self.bg_checksum =
            checksum::group_desc_csum(uuid, group_num, &bytes[..desc_size as usize]);
    }
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq, Eq)]
pub struct Ext4Inode {
    pub i_mode: u16,        /* File mode */
    pub i_uid: u16,         /* Low 16 bits of Owner Uid */
    i_size_lo: u32,         /* Size in bytes */
    pub i_atime: u32,       /* Access time */
    pub i_ctime: u32,       /* Inode Change time */
    pub i_mtime: u32,       /* Modification time */
    pub i_dtime: u32,       /* Deletion Time */
    pub i_gid: u16,         /* Low 16 bits of Group Id */
    pub i_links_count: u16, /* Links count */
    i_blocks_lo: u32,       /* Blocks count */
    pub i_flags: u32,       /* File flags */
    pub l_i_version: u32,   /* OS dependent 1 */
    pub i_block: [u8; 60],  /* Extent tree root, inline */
    pub i_generation: u32,  /* File version (for NFS) */
    pub i_file_acl_lo: u32, /* File ACL */
    i_size_high: u32,
    pub i_obso_faddr: u32, /* Obsoleted fragment address */
    i_blocks_high: u16,    /* were l_i_reserved1 */
    pub i_file_acl_high: u16,
    pub i_uid_high: u16,    /* these 2 fields */
    pub i_gid_high: u16,    /* were reserved2[0] */
    pub i_checksum_lo: u16, /* crc32c(uuid+inum+inode) LE */
    pub l_i_reserved: u16,
    pub i_extra_isize: u16,
    pub i_checksum_hi: u16,  /* crc32c(uuid+inum+inode) BE */
    pub i_ctime_extra: u32,  /* extra Change time      (nsec << 2 | epoch) */
    pub i_mtime_extra: u32,  /* extra Modification time(nsec << 2 | epoch) */
    pub i_atime_extra: u32,  /* extra Access time      (nsec << 2 | epoch) */
    pub i_crtime: u32,       /* File Creation time */
    pub i_crtime_extra: u32, /* extra FileCreationtime (nsec << 2 | epoch) */
    pub i_version_hi: u32,   /* high 32 bits for 64-bit version */
    pub i_projid: u32,       /* Project ID */
    pub padding: StaticLenString<96>,
}

impl Default for Ext4Inode {
    fn default() -> Self {
        binread_from_buf(&[0u8; 256]).unwrap()
    }
}

impl Ext4Inode {
    pub const SIZE: u64 = 256;

    pub fn size(&self) -> u64 {
        ((self.i_size_high as u64) << 32) | (self.i_size_lo as u64)
    }

    pub fn set_size(&mut self, size: u64) {
        self.i_size_lo = size as u32;
        self.i_size_high = (size >> 32) as u32;
    }

    /// Count of 512-byte sectors charged to this inode.
    pub fn blocks(&self) -> u64 {
        ((self.i_blocks_high as u64) << 32) | (self.i_blocks_lo as u64)
    }

    pub fn set_blocks(&mut self, sectors: u64) {
        self.i_blocks_lo = sectors as u32;
        self.i_blocks_high = (sectors >> 32) as u16;
    }

    pub fn is_directory(&self) -> bool {
        self.i_mode & 0xF000 == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.i_mode & 0xF000 == S_IFREG
    }

    pub fn has_extents(&self) -> bool {
        self.i_flags & INODE_FLAG_EXTENTS != 0
    }

    pub fn is_htree_dir(&self) -> bool {
        self.i_flags & INODE_FLAG_INDEX != 0
    }

    pub fn set_checksum(&mut self, csum: u32, inode_size: u16) {
        self.i_checksum_lo = csum as u16;
        if inode_size > 128 {
            self.i_checksum_hi = (csum >> 16) as u16;
        }
    }

    pub fn stored_checksum(&self, inode_size: u16) -> u32 {
        if inode_size > 128 && self.i_extra_isize >= 4 {
            ((self.i_checksum_hi as u32) << 16) | (self.i_checksum_lo as u32)
        } else {
            self.i_checksum_lo as u32
        }
    }
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq, Eq)]
pub struct Ext4ExtentHeader {
    pub eh_magic: u16,      /* probably will support different formats */
    pub eh_entries: u16,    /* number of valid entries */
    pub eh_max: u16,        /* capacity of store in entries */
    pub eh_depth: u16,      /* has tree real underlying blocks? */
    pub eh_generation: u32, /* generation of the tree */
}

impl Ext4ExtentHeader {
    pub const SIZE: usize = 12;

    /// Fresh root header for the 60-byte inline region: 4 entry slots, depth 0.
    pub fn new_inline_root() -> Self {
        Ext4ExtentHeader {
            eh_magic: EXTENT_MAGIC,
            eh_entries: 0,
            eh_max: 4,
            eh_depth: 0,
            eh_generation: 0,
        }
    }
}

#[derive(Debug, BinRead, BinWrite, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ext4Extent {
    pub ee_block: u32, /* first logical block extent covers */
    pub ee_len: u16,   /* number of blocks covered by extent */
    ee_start_hi: u16,  /* high 16 bits of physical block */
    ee_start_lo: u32,  /* low 32 bits of physical block */
}

impl Ext4Extent {
    pub const SIZE: usize = 12;
    /// Longest initialized extent; larger `ee_len` values mark unwritten extents.
    pub const MAX_LEN: u16 = 32768;

    pub fn new(logical: u32, physical: u64, len: u16) -> Self {
        Ext4Extent {
            ee_block: logical,
            ee_len: len,
            ee_start_lo: physical as u32,
            ee_start_hi: (physical >> 32) as u16,
        }
    }

    pub fn start(&self) -> u64 {
        ((self.ee_start_hi as u64) << 32) | (self.ee_start_lo as u64)
    }

    /// Initialized length; unwritten extents store `len + 32768`.
    pub fn len(&self) -> u16 {
        if self.ee_len > Self::MAX_LEN {
            self.ee_len - Self::MAX_LEN
        } else {
            self.ee_len
        }
    }

    pub fn set_len(&mut self, len: u16) {
        self.ee_len = len;
    }
}

#[derive(Debug, BinRead, BinWrite, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ext4ExtentIdx {
    pub ei_block: u32, /* index covers logical blocks from 'block' */
    ei_leaf_lo: u32,   /* pointer to the physical block of the next level */
    ei_leaf_hi: u16,   /* high 16 bits of physical block */
    pub ei_unused: u16,
}

impl Ext4ExtentIdx {
    pub fn leaf(&self) -> u64 {
        ((self.ei_leaf_hi as u64) << 32) | (self.ei_leaf_lo as u64)
    }
}

/// The 12-byte fake entry closing every checksummed directory block.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq, Eq)]
pub struct Ext4DirEntryTail {
    pub det_reserved_zero1: u32, /* pretend to be unused */
    pub det_rec_len: u16,        /* 12 */
    pub det_reserved_zero2: u8,  /* zero name length */
    pub det_reserved_ft: u8,     /* 0xDE, fake file type */
    pub det_checksum: u32,       /* crc32c(uuid+inum+dirblock) */
}

impl Ext4DirEntryTail {
    pub const SIZE: usize = 12;

    pub fn new(csum: u32) -> Self {
        Ext4DirEntryTail {
            det_reserved_zero1: 0,
            det_rec_len: 12,
            det_reserved_zero2: 0,
            det_reserved_ft: DIRENT_TAIL_FTYPE,
            det_checksum: csum,
        }
    }

    pub fn looks_like_tail(&self) -> bool {
        self.det_reserved_zero1 == 0
            && self.det_rec_len == 12
            && self.det_reserved_zero2 == 0
            && self.det_reserved_ft == DIRENT_TAIL_FTYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_len_str_str_len() {
        let s = StaticLenString::<16>::from_str("Hello, world!");
        assert_eq!(s.as_str(), "Hello, world!");
    }

    macro_rules! test_size_of {
        ($test_name:ident, $item:expr, $size:expr) => {
            #[test]
            fn $test_name() {
                let x = $item;
                let mut bytes = Cursor::new(Vec::new());
                x.write_le(&mut bytes).unwrap();
                assert_eq!(bytes.get_ref().len(), $size);
            }
        };
    }

    test_size_of!(test_superblock_size, Ext4SuperBlock::default(), 1024);
    test_size_of!(
        test_group_descriptor_size,
        Ext4GroupDescriptor::default(),
        64
    );
    test_size_of!(test_inode_size, Ext4Inode::default(), 256);
    test_size_of!(
        test_extent_header_size,
        Ext4ExtentHeader::new_inline_root(),
        12
    );
    test_size_of!(test_extent_size, Ext4Extent::default(), 12);
    test_size_of!(test_extent_idx_size, Ext4ExtentIdx::default(), 12);
    test_size_of!(test_dirent_tail_size, Ext4DirEntryTail::new(0), 12);

    #[test]
    fn test_superblock_round_trip() {
        let mut sb = Ext4SuperBlock::default();
        sb.s_magic = EXT4_MAGIC;
        sb.set_blocks_count(0x1_0000_2000);
        sb.s_inodes_per_group = 512;
        sb.s_volume_name = StaticLenString::from_str("rootfs");
        let bytes = binwrite_as_buf(&sb).unwrap();
        let back: Ext4SuperBlock = binread_from_buf(&bytes).unwrap();
        assert_eq!(back, sb);
        assert_eq!(back.blocks_count(), 0x1_0000_2000);
        assert_eq!(back.label(), "rootfs");
    }

    #[test]
    fn test_inode_split_size() {
        let mut inode = Ext4Inode::default();
        inode.set_size(0x1_2345_6789);
        assert_eq!(inode.size(), 0x1_2345_6789);
        let bytes = binwrite_as_buf(&inode).unwrap();
        let back: Ext4Inode = binread_from_buf(&bytes).unwrap();
        assert_eq!(back.size(), 0x1_2345_6789);
    }

    #[test]
    fn test_descriptor_checksum_covers_desc_size() {
        let uuid = [3u8; 16];
        let mut desc = Ext4GroupDescriptor::default();
        desc.set_inode_table(1234);
        desc.update_checksum(&uuid, 7, 64);
        let stored = desc.bg_checksum;
        desc.bg_checksum = 0;
        let bytes = binwrite_as_buf(&desc).unwrap();
        assert_eq!(crate::checksum::group_desc_csum(&uuid, 7, &bytes), stored);
    }

    #[test]
    fn test_extent_unwritten_len() {
        let mut e = Ext4Extent::new(0, 100, 10);
        assert_eq!(e.len(), 10);
        e.ee_len = 32768 + 10;
        assert_eq!(e.len(), 10);
    }
}
