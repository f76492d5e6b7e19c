#![doc = include_str!("../README.md")]

use bitflags::bitflags;
use log::debug;

mod alloc;
mod checksum;
mod device;
mod dir;
mod error;
mod ext4_h;
mod extent;
mod file;
mod format;

pub use device::ByteDevice;
pub use error::{Ext4Error, Result};
pub use ext4_h::{Ext4GroupDescriptor, Ext4Inode, Ext4SuperBlock};
pub use file::File;
pub use format::{format, FormatOptions};

use device::Volume;
use ext4_h::{
    binread_from_buf, binwrite_as_buf, FileType, IncompatFeatures, RoCompatFeatures, EXT4_MAGIC,
    ROOT_INO, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, S_IFDIR, S_IFREG,
};

bitflags! {
    /// Flags accepted by [`Ext4Fs::open_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const READ_WRITE = 0x3;
        /// Create the file when the final path component is missing.
        const CREATE = 0x4;
        /// Position the handle at the end of the file instead of the start.
        const APPEND = 0x8;
    }
}

/// One directory child as reported by [`Ext4Fs::read_dir`] and [`Ext4Fs::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub inode: u32,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u32,
    pub is_dir: bool,
}

pub(crate) fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

/// An open ext4 volume.
///
/// The engine owns the device for its whole lifetime and is the only writer
/// through it; callers must guarantee exclusive access. All mutations are
/// synchronous, with affected metadata checksums refreshed before each write.
#[derive(Debug)]
pub struct Ext4Fs<D: ByteDevice> {
    pub(crate) vol: Volume<D>,
    pub(crate) sb: Ext4SuperBlock,
}

impl<D: ByteDevice> Ext4Fs<D> {
    /// Open the ext4 volume that starts `start` bytes into `dev`.
    ///
    /// `size` is the number of bytes backing the volume; pass 0 when unknown.
    /// `blocksize` is accepted for interface parity with partition probers and
    /// ignored: geometry always comes from the superblock.
    pub fn open(dev: D, size: u64, start: u64, blocksize: u64) -> Result<Self> {
        let _ = blocksize;
        let mut vol = Volume::new(dev, start);
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        vol.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let sb: Ext4SuperBlock = binread_from_buf(&raw)?;
        if sb.s_magic != EXT4_MAGIC {
            return Err(Ext4Error::BadMagic { found: sb.s_magic });
        }

        let supported = IncompatFeatures::FILETYPE
            | IncompatFeatures::EXTENTS
            | IncompatFeatures::BIT64
            | IncompatFeatures::FLEX_BG;
        let unknown = sb.incompat().difference(supported);
        if !unknown.is_empty() {
            return Err(Ext4Error::Unsupported(format!(
                "incompat feature bits {:#x}",
                unknown.bits()
            )));
        }
        let required = IncompatFeatures::FILETYPE | IncompatFeatures::EXTENTS;
        if !sb.incompat().contains(required) {
            return Err(Ext4Error::Unsupported(
                "volumes without the filetype and extents features".into(),
            ));
        }
        if sb.ro_compat().contains(RoCompatFeatures::BIGALLOC) {
            return Err(Ext4Error::Unsupported("bigalloc cluster allocation".into()));
        }
        if sb.s_rev_level > 0 && sb.s_inode_size != 128 && sb.s_inode_size != 256 {
            return Err(Ext4Error::Unsupported(format!(
                "inode size {}",
                sb.s_inode_size
            )));
        }
        if sb.has_metadata_csum() && checksum::superblock_csum(&raw) != sb.s_checksum {
            return Err(Ext4Error::ChecksumMismatch {
                object: "superblock",
                index: 0,
            });
        }
        if size > 0 && sb.blocks_count() * sb.block_size() > size {
            return Err(Ext4Error::Corrupt(format!(
                "superblock claims {} blocks of {} bytes but the device holds {size} bytes",
                sb.blocks_count(),
                sb.block_size()
            )));
        }

        debug!(
            "opened ext4 volume '{}': {} blocks of {} bytes in {} groups",
            sb.label(),
            sb.blocks_count(),
            sb.block_size(),
            sb.block_groups_count()
        );
        Ok(Ext4Fs { vol, sb })
    }

    pub fn label(&self) -> &str {
        self.sb.label()
    }

    pub fn superblock(&self) -> &Ext4SuperBlock {
        &self.sb
    }

    /// Release the device. All metadata is already flushed; nothing is written.
    pub fn close(self) -> D {
        self.vol.into_inner()
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    pub(crate) fn inode_size(&self) -> u16 {
        if self.sb.s_rev_level == 0 {
            128
        } else {
            self.sb.s_inode_size
        }
    }

    pub(crate) fn write_superblock(&mut self) -> Result<()> {
        let mut raw = binwrite_as_buf(&self.sb)?;
        if self.sb.has_metadata_csum() {
            self.sb.s_checksum = checksum::superblock_csum(&raw);
            raw[0x3FC..0x400].copy_from_slice(&self.sb.s_checksum.to_le_bytes());
        }
        self.vol.write_at(SUPERBLOCK_OFFSET, &raw)?;
        Ok(())
    }

    pub(crate) fn read_group_desc(&mut self, group: u64) -> Result<Ext4GroupDescriptor> {
        let ds = self.sb.desc_size() as usize;
        let mut raw = [0u8; 64];
        self.vol
            .read_at(self.sb.gdt_offset() + group * ds as u64, &mut raw[..ds])?;
        let desc: Ext4GroupDescriptor = binread_from_buf(&raw)?;
        if self.sb.has_metadata_csum()
            && checksum::group_desc_csum(self.sb.uuid(), group, &raw[..ds]) != desc.bg_checksum
        {
            return Err(Ext4Error::ChecksumMismatch {
                object: "group descriptor",
                index: group,
            });
        }
        Ok(desc)
    }

    pub(crate) fn write_group_desc(
        &mut self,
        group: u64,
        desc: &mut Ext4GroupDescriptor,
    ) -> Result<()> {
        let ds = self.sb.desc_size();
        if self.sb.has_metadata_csum() {
            desc.update_checksum(self.sb.uuid(), group, ds);
        }
        let raw = binwrite_as_buf(desc)?;
        self.vol
            .write_at(self.sb.gdt_offset() + group * ds, &raw[..ds as usize])?;
        Ok(())
    }

    /// Byte offset of inode `num` inside the volume.
    fn inode_location(&mut self, num: u32) -> Result<u64> {
        let ipg = self.sb.s_inodes_per_group;
        let group = ((num - 1) / ipg) as u64;
        let index = ((num - 1) % ipg) as u64;
        let desc = self.read_group_desc(group)?;
        Ok(desc.inode_table() * self.block_size() + index * self.inode_size() as u64)
    }

    pub(crate) fn read_inode(&mut self, num: u32) -> Result<Ext4Inode> {
        if num == 0 || num > self.sb.s_inodes_count {
            return Err(Ext4Error::Corrupt(format!("inode number {num} out of range")));
        }
        let isz = self.inode_size() as usize;
        let location = self.inode_location(num)?;
        let mut raw = [0u8; 256];
        self.vol.read_at(location, &mut raw[..isz])?;
        let inode: Ext4Inode = binread_from_buf(&raw)?;
        if self.sb.has_metadata_csum() && isz > 128 {
            let computed =
                checksum::inode_csum(self.sb.uuid(), num, inode.i_generation, &raw[..isz]);
            if computed != inode.stored_checksum(isz as u16) {
                return Err(Ext4Error::ChecksumMismatch {
                    object: "inode",
                    index: num as u64,
                });
            }
        }
        Ok(inode)
    }

    /// Refresh the inode checksum and write the record back to its table slot.
    pub(crate) fn write_inode(&mut self, num: u32, inode: &mut Ext4Inode) -> Result<()> {
        let isz = self.inode_size() as usize;
        let location = self.inode_location(num)?;
        let mut raw = binwrite_as_buf(inode)?;
        if self.sb.has_metadata_csum() && isz > 128 {
            let csum = checksum::inode_csum(self.sb.uuid(), num, inode.i_generation, &raw[..isz]);
            inode.set_checksum(csum, isz as u16);
            raw[0x7C..0x7E].copy_from_slice(&inode.i_checksum_lo.to_le_bytes());
            raw[0x82..0x84].copy_from_slice(&inode.i_checksum_hi.to_le_bytes());
        }
        self.vol.write_at(location, &raw[..isz])?;
        Ok(())
    }

    /// Walk `path` from the root directory, component by component.
    fn resolve(&mut self, path: &str) -> Result<(u32, Ext4Inode)> {
        let mut num = ROOT_INO;
        let mut inode = self.read_inode(num)?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !inode.is_directory() {
                return Err(Ext4Error::NotADirectory(path.to_string()));
            }
            let entries = self.dir_entries(num, &inode)?;
            match entries.iter().find(|e| e.name == part) {
                Some(entry) => {
                    num = entry.inode;
                    inode = self.read_inode(num)?;
                }
                None => return Err(Ext4Error::NotFound(path.to_string())),
            }
        }
        Ok((num, inode))
    }

    /// List a directory. Children are reported in on-disk order, `.` and `..`
    /// included.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<FileInfo>> {
        let (num, inode) = self.resolve(path)?;
        if !inode.is_directory() {
            return Err(Ext4Error::NotADirectory(path.to_string()));
        }
        let mut infos = Vec::new();
        for entry in self.dir_entries(num, &inode)? {
            let child = self.read_inode(entry.inode)?;
            infos.push(FileInfo {
                name: entry.name,
                inode: entry.inode,
                size: child.size(),
                mtime: child.i_mtime,
                is_dir: child.is_directory(),
            });
        }
        Ok(infos)
    }

    pub fn stat(&mut self, path: &str) -> Result<FileInfo> {
        let (num, inode) = self.resolve(path)?;
        let (_, name) = split_parent(path);
        Ok(FileInfo {
            name: if name.is_empty() { "/" } else { name }.to_string(),
            inode: num,
            size: inode.size(),
            mtime: inode.i_mtime,
            is_dir: inode.is_directory(),
        })
    }

    /// Open a regular file, creating it when `CREATE` is set and the final
    /// component is missing. With `APPEND` the handle starts at the file's end.
    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<File<'_, D>> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(Ext4Error::IsDirectory(path.to_string()));
        }
        let (parent_num, parent_inode) = self.resolve(parent)?;
        if !parent_inode.is_directory() {
            return Err(Ext4Error::NotADirectory(parent.to_string()));
        }
        let existing = self
            .dir_entries(parent_num, &parent_inode)?
            .into_iter()
            .find(|e| e.name == name);

        let (num, inode) = match existing {
            Some(entry) => {
                let inode = self.read_inode(entry.inode)?;
                if inode.is_directory() {
                    return Err(Ext4Error::IsDirectory(path.to_string()));
                }
                (entry.inode, inode)
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(Ext4Error::NotFound(path.to_string()));
                }
                debug!("creating file '{path}'");
                let (num, inode) = self.create_inode(S_IFREG | 0o777)?;
                self.dir_add_entry(parent_num, name, num, FileType::RegularFile)?;
                (num, inode)
            }
        };

        let pos = if flags.contains(OpenFlags::APPEND) {
            inode.size()
        } else {
            0
        };
        Ok(File {
            fs: self,
            num,
            inode,
            pos,
        })
    }

    /// Create a directory. Idempotent: an already existing directory is fine.
    /// Parent components must exist.
    pub fn mkdir(&mut self, path: &str, perm: u16) -> Result<()> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            // the root always exists
            return Ok(());
        }
        let (parent_num, parent_inode) = self.resolve(parent)?;
        if !parent_inode.is_directory() {
            return Err(Ext4Error::NotADirectory(parent.to_string()));
        }
        if let Some(entry) = self
            .dir_entries(parent_num, &parent_inode)?
            .into_iter()
            .find(|e| e.name == name)
        {
            let existing = self.read_inode(entry.inode)?;
            return if existing.is_directory() {
                Ok(())
            } else {
                Err(Ext4Error::NotADirectory(path.to_string()))
            };
        }

        debug!("mkdir '{path}'");
        let (num, mut inode) = self.create_inode(S_IFDIR | (perm & 0x1FF))?;
        let bs = self.block_size();
        let (block, _) = self.get_free_blocks(1)?;
        let layout = dir::build_dir_block(
            bs as usize,
            self.sb.has_metadata_csum(),
            self.sb.uuid(),
            num,
            inode.i_generation,
            &[
                (num, FileType::Directory, "."),
                (parent_num, FileType::Directory, ".."),
            ],
        );
        self.vol.write_at(block * bs, &layout)?;
        extent::append_to_root(&mut inode.i_block, 0, block, 1)?;
        inode.set_size(bs);
        inode.set_blocks(bs / 512);
        inode.i_links_count = 2;
        self.write_inode(num, &mut inode)?;

        self.dir_add_entry(parent_num, name, num, FileType::Directory)?;
        // `..` holds one more reference to the parent
        let mut parent_inode = self.read_inode(parent_num)?;
        parent_inode.i_links_count += 1;
        self.write_inode(parent_num, &mut parent_inode)?;

        let group = ((num - 1) / self.sb.s_inodes_per_group) as u64;
        let mut desc = self.read_group_desc(group)?;
        desc.set_used_dirs_count(desc.used_dirs_count() + 1);
        self.write_group_desc(group, &mut desc)?;
        Ok(())
    }

    /// Delete a file or an empty directory: the entry is merged away, data
    /// blocks and the inode bit are released, and the inode record is retired
    /// with a bumped generation.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(Ext4Error::IsDirectory(path.to_string()));
        }
        let (parent_num, parent_inode) = self.resolve(parent)?;
        if !parent_inode.is_directory() {
            return Err(Ext4Error::NotADirectory(parent.to_string()));
        }
        let entry = self
            .dir_entries(parent_num, &parent_inode)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Ext4Error::NotFound(path.to_string()))?;
        let num = entry.inode;
        let mut inode = self.read_inode(num)?;
        let is_dir = inode.is_directory();
        if is_dir {
            let children = self.dir_entries(num, &inode)?;
            if children.iter().any(|e| e.name != "." && e.name != "..") {
                return Err(Ext4Error::NotEmpty(path.to_string()));
            }
        }

        debug!("removing '{path}' (inode {num})");
        self.dir_remove_entry(parent_num, name)?;
        for (start, len) in self.collect_extents(num, &inode)? {
            self.free_blocks(start, len)?;
        }
        self.free_inode(num, is_dir)?;
        if is_dir {
            let mut parent_inode = self.read_inode(parent_num)?;
            parent_inode.i_links_count -= 1;
            self.write_inode(parent_num, &mut parent_inode)?;
        }

        inode.i_links_count = 0;
        inode.i_dtime = unix_now();
        inode.i_generation = inode.i_generation.wrapping_add(1);
        inode.set_size(0);
        inode.set_blocks(0);
        extent::init_root(&mut inode.i_block);
        self.write_inode(num, &mut inode)?;
        Ok(())
    }

    /// Allocate and persist a fresh inode with the given mode bits.
    fn create_inode(&mut self, mode: u16) -> Result<(u32, Ext4Inode)> {
        let num = self.alloc_inode()?;
        let now = unix_now();
        let mut inode = Ext4Inode::default();
        inode.i_mode = mode;
        inode.i_links_count = 1;
        inode.i_atime = now;
        inode.i_ctime = now;
        inode.i_mtime = now;
        inode.i_crtime = now;
        inode.i_flags = ext4_h::INODE_FLAG_EXTENTS;
        if self.inode_size() > 128 {
            inode.i_extra_isize = 32;
        }
        extent::init_root(&mut inode.i_block);
        self.write_inode(num, &mut inode)?;
        Ok((num, inode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    const TEST_UUID: [u8; 16] = [
        0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE,
        0xF0,
    ];

    type MemFs = Ext4Fs<Cursor<Vec<u8>>>;

    fn fresh_volume(size: u64) -> Cursor<Vec<u8>> {
        let dev = Cursor::new(vec![0u8; size as usize]);
        format(
            dev,
            &FormatOptions {
                size_bytes: size,
                block_size: 1024,
                uuid: TEST_UUID,
                label: "testvol".to_string(),
            },
        )
        .unwrap()
    }

    fn fresh_fs() -> MemFs {
        Ext4Fs::open(fresh_volume(16 * 1024 * 1024), 0, 0, 0).unwrap()
    }

    fn reopen(fs: MemFs) -> MemFs {
        Ext4Fs::open(fs.close(), 0, 0, 0).unwrap()
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dev = Cursor::new(vec![0u8; 2 * 1024 * 1024]);
        let err = Ext4Fs::open(dev, 0, 0, 0).unwrap_err();
        assert!(matches!(err, Ext4Error::BadMagic { found: 0 }));
    }

    #[test]
    fn test_open_rejects_unknown_incompat_feature() {
        let mut dev = fresh_volume(2 * 1024 * 1024);
        // flip INLINE_DATA on and refresh the superblock checksum
        let mut raw = [0u8; 1024];
        raw.copy_from_slice(&dev.get_ref()[1024..2048]);
        let incompat = u32::from_le_bytes(raw[0x60..0x64].try_into().unwrap()) | 0x8000;
        raw[0x60..0x64].copy_from_slice(&incompat.to_le_bytes());
        let csum = crate::checksum::superblock_csum(&raw);
        raw[0x3FC..0x400].copy_from_slice(&csum.to_le_bytes());
        dev.get_mut()[1024..2048].copy_from_slice(&raw);

        let err = Ext4Fs::open(dev, 0, 0, 0).unwrap_err();
        assert!(matches!(err, Ext4Error::Unsupported(_)));
    }

    #[test]
    fn test_open_at_offset() {
        let formatted = fresh_volume(4 * 1024 * 1024).into_inner();
        let mut shifted = vec![0xEEu8; 8192];
        shifted.extend_from_slice(&formatted);
        let mut fs = Ext4Fs::open(Cursor::new(shifted), 0, 8192, 0).unwrap();
        assert_eq!(fs.label(), "testvol");
        assert!(fs.read_dir("/").is_ok());
    }

    #[test]
    fn test_label() {
        let fs = fresh_fs();
        assert_eq!(fs.label(), "testvol");
    }

    #[test]
    fn test_root_listing_contains_lost_and_found() {
        let mut fs = fresh_fs();
        let listing = fs.read_dir("/").unwrap();
        let lpf = listing
            .iter()
            .find(|e| e.name == "lost+found")
            .expect("lost+found in a fresh volume");
        assert!(lpf.is_dir);
        let inode = fs.read_inode(lpf.inode).unwrap();
        assert_ne!(inode.i_mode & 0x4000, 0);
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let data = b"userid = \"ABCD\"\n\nvalidPeriodOfDays = 100\n";
        assert_eq!(data.len(), 42);

        let dev = fresh_volume(64 * 1024 * 1024);
        let mut fs = Ext4Fs::open(dev, 64 * 1024 * 1024, 0, 0).unwrap();
        fs.mkdir("/etc", 0o755).unwrap();
        let mut file = fs
            .open_file("/etc/c3p1.conf", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        file.write_all(data).unwrap();
        file.close();

        let mut fs = reopen(fs);
        let mut file = fs.open_file("/etc/c3p1.conf", OpenFlags::READ).unwrap();
        assert_eq!(file.size(), 42);
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_single_byte_modify_persists() {
        let mut fs = fresh_fs();
        fs.mkdir("/boot", 0o755).unwrap();
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut file = fs
            .open_file("/boot/dietpi.txt", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        file.write_all(&content).unwrap();
        file.close();

        let mut fs = reopen(fs);
        let mut file = fs
            .open_file("/boot/dietpi.txt", OpenFlags::READ_WRITE)
            .unwrap();
        let mut buf = [0u8; 10];
        file.read_exact(&mut buf).unwrap();
        buf[1] = (buf[1] + 1) % 127;
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&buf).unwrap();
        file.close();

        let mut fs = reopen(fs);
        let mut file = fs.open_file("/boot/dietpi.txt", OpenFlags::READ).unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        assert_eq!(&back[..10], &buf);
        assert_eq!(&back[10..], &content[10..]);
    }

    #[test]
    fn test_mkdir_updates_counters_and_layout() {
        let mut fs = fresh_fs();
        let free_inodes_before = fs.superblock().s_free_inodes_count;
        let used_dirs_before = fs.read_group_desc(0).unwrap().used_dirs_count();
        let root_links_before = fs.read_inode(ROOT_INO).unwrap().i_links_count;

        fs.mkdir("/newdir", 0o755).unwrap();

        assert_eq!(fs.superblock().s_free_inodes_count, free_inodes_before - 1);
        assert_eq!(
            fs.read_group_desc(0).unwrap().used_dirs_count(),
            used_dirs_before + 1
        );
        assert_eq!(
            fs.read_inode(ROOT_INO).unwrap().i_links_count,
            root_links_before + 1
        );

        let names: Vec<String> = fs
            .read_dir("/newdir")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", ".."]);

        let info = fs.stat("/newdir").unwrap();
        let new_inode = fs.read_inode(info.inode).unwrap();
        assert_eq!(new_inode.i_links_count, 2);
    }

    #[test]
    fn test_mkdir_is_idempotent() {
        let mut fs = fresh_fs();
        fs.mkdir("/newdir", 0o755).unwrap();
        let free_inodes = fs.superblock().s_free_inodes_count;
        let free_blocks = fs.superblock().free_blocks_count();
        fs.mkdir("/newdir", 0o755).unwrap();
        assert_eq!(fs.superblock().s_free_inodes_count, free_inodes);
        assert_eq!(fs.superblock().free_blocks_count(), free_blocks);
    }

    #[test]
    fn test_create_in_missing_parent_leaves_counters_alone() {
        let mut fs = fresh_fs();
        let free_inodes = fs.superblock().s_free_inodes_count;
        let free_blocks = fs.superblock().free_blocks_count();
        let err = fs
            .open_file("/no/such/dir/file", OpenFlags::CREATE)
            .unwrap_err();
        assert!(matches!(err, Ext4Error::NotFound(_)));
        assert_eq!(fs.superblock().s_free_inodes_count, free_inodes);
        assert_eq!(fs.superblock().free_blocks_count(), free_blocks);
    }

    #[test]
    fn test_intermediate_file_component_is_not_a_directory() {
        let mut fs = fresh_fs();
        let mut file = fs
            .open_file("/plain.txt", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(b"x").unwrap();
        file.close();
        let err = fs.read_dir("/plain.txt/sub").unwrap_err();
        assert!(matches!(err, Ext4Error::NotADirectory(_)));
        let err = fs.read_dir("/plain.txt").unwrap_err();
        assert!(matches!(err, Ext4Error::NotADirectory(_)));
    }

    #[test]
    fn test_open_directory_as_file_fails() {
        let mut fs = fresh_fs();
        fs.mkdir("/etc", 0o755).unwrap();
        assert!(matches!(
            fs.open_file("/etc", OpenFlags::READ),
            Err(Ext4Error::IsDirectory(_))
        ));
        assert!(matches!(
            fs.open_file("/", OpenFlags::READ),
            Err(Ext4Error::IsDirectory(_))
        ));
    }

    #[test]
    fn test_append_flag_continues_at_end() {
        let mut fs = fresh_fs();
        let mut file = fs
            .open_file("/log.txt", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(b"abc").unwrap();
        file.close();

        let mut file = fs
            .open_file("/log.txt", OpenFlags::WRITE | OpenFlags::APPEND)
            .unwrap();
        file.write_all(b"def").unwrap();
        file.close();

        let mut file = fs.open_file("/log.txt", OpenFlags::READ).unwrap();
        let mut back = String::new();
        file.read_to_string(&mut back).unwrap();
        assert_eq!(back, "abcdef");
    }

    #[test]
    fn test_seek_past_end_then_write_leaves_hole() {
        let mut fs = fresh_fs();
        let mut file = fs
            .open_file("/sparse.bin", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        file.write_all(b"head").unwrap();
        file.seek(SeekFrom::Start(5000)).unwrap();
        file.write_all(b"tail").unwrap();
        assert_eq!(file.size(), 5004);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        assert_eq!(&back[..4], b"head");
        assert!(back[1024..5000].iter().all(|&b| b == 0));
        assert_eq!(&back[5000..], b"tail");
    }

    #[test]
    fn test_multi_block_file_round_trips() {
        let mut fs = fresh_fs();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut file = fs
            .open_file("/big.bin", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        file.write_all(&data).unwrap();
        file.close();

        let mut fs = reopen(fs);
        let mut file = fs.open_file("/big.bin", OpenFlags::READ).unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_fragmented_file_overflows_inline_extents() {
        let mut fs = fresh_fs();
        fs.open_file("/a.bin", OpenFlags::CREATE).unwrap().close();
        fs.open_file("/b.bin", OpenFlags::CREATE).unwrap().close();

        let block = vec![0x5Au8; 1024];
        let mut failed = false;
        // alternating appends interleave the two files' physical blocks, so
        // every extent of /a.bin is a single block and the fifth cannot fit
        for round in 0..5 {
            let mut a = fs
                .open_file("/a.bin", OpenFlags::WRITE | OpenFlags::APPEND)
                .unwrap();
            match a.write_all(&block) {
                Ok(()) => {}
                Err(err) => {
                    assert!(round >= 4);
                    let inner = err.get_ref().and_then(|e| e.downcast_ref::<Ext4Error>());
                    assert!(matches!(inner, Some(Ext4Error::FileTooLarge)));
                    failed = true;
                    break;
                }
            }
            a.close();
            let mut b = fs
                .open_file("/b.bin", OpenFlags::WRITE | OpenFlags::APPEND)
                .unwrap();
            b.write_all(&block).unwrap();
            b.close();
        }
        assert!(failed);
    }

    #[test]
    fn test_remove_file_releases_space() {
        let mut fs = fresh_fs();
        let free_inodes = fs.superblock().s_free_inodes_count;
        let free_blocks = fs.superblock().free_blocks_count();

        let mut file = fs
            .open_file("/doomed.bin", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(&vec![1u8; 4096]).unwrap();
        file.close();
        fs.remove("/doomed.bin").unwrap();

        assert_eq!(fs.superblock().s_free_inodes_count, free_inodes);
        assert_eq!(fs.superblock().free_blocks_count(), free_blocks);
        assert!(matches!(
            fs.open_file("/doomed.bin", OpenFlags::READ),
            Err(Ext4Error::NotFound(_))
        ));

        // the volume stays clean for a fresh open
        let mut fs = reopen(fs);
        assert!(fs.read_dir("/").is_ok());
    }

    #[test]
    fn test_remove_directory_rules() {
        let mut fs = fresh_fs();
        fs.mkdir("/d", 0o755).unwrap();
        fs.open_file("/d/f", OpenFlags::CREATE).unwrap().close();

        assert!(matches!(fs.remove("/d"), Err(Ext4Error::NotEmpty(_))));
        fs.remove("/d/f").unwrap();
        let root_links = fs.read_inode(ROOT_INO).unwrap().i_links_count;
        fs.remove("/d").unwrap();
        assert_eq!(fs.read_inode(ROOT_INO).unwrap().i_links_count, root_links - 1);
        assert!(matches!(fs.read_dir("/d"), Err(Ext4Error::NotFound(_))));
    }

    #[test]
    fn test_directory_grows_past_one_block() {
        let mut fs = fresh_fs();
        fs.mkdir("/spill", 0o755).unwrap();
        // ~20 bytes per entry against 1012 usable bytes per 1 KiB block
        for i in 0..60 {
            fs.open_file(&format!("/spill/file-{i:02}.txt"), OpenFlags::CREATE)
                .unwrap()
                .close();
        }
        let info = fs.stat("/spill").unwrap();
        assert!(info.size >= 2048);

        let mut fs = reopen(fs);
        let listing = fs.read_dir("/spill").unwrap();
        assert_eq!(listing.len(), 62);
        for i in 0..60 {
            let name = format!("file-{i:02}.txt");
            assert!(listing.iter().any(|e| e.name == name), "missing {name}");
        }
    }

    #[test]
    fn test_counters_match_group_sums() {
        let mut fs = fresh_fs();
        fs.mkdir("/x", 0o755).unwrap();
        let mut file = fs
            .open_file("/x/data", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(&vec![9u8; 3000]).unwrap();
        file.close();
        fs.remove("/x/data").unwrap();

        let groups = fs.superblock().block_groups_count();
        let mut free_inodes = 0u32;
        let mut free_blocks = 0u64;
        for g in 0..groups {
            let desc = fs.read_group_desc(g).unwrap();
            free_inodes += desc.free_inodes_count();
            free_blocks += desc.free_blocks_count() as u64;
        }
        assert_eq!(fs.superblock().s_free_inodes_count, free_inodes);
        assert_eq!(fs.superblock().free_blocks_count(), free_blocks);
    }

    #[test]
    fn test_directory_blocks_tile_exactly() {
        let mut fs = fresh_fs();
        fs.mkdir("/t", 0o755).unwrap();
        for i in 0..5 {
            fs.open_file(&format!("/t/entry{i}"), OpenFlags::CREATE)
                .unwrap()
                .close();
        }
        let (num, inode) = fs.resolve("/t").unwrap();
        let bs = fs.block_size();
        for lblock in 0..inode.size() / bs {
            let phys = fs.map_file_block(num, &inode, lblock).unwrap().unwrap();
            let mut block = vec![0u8; bs as usize];
            fs.vol.read_at(phys * bs, &mut block).unwrap();
            let mut off = 0usize;
            while off < block.len() {
                let rec_len =
                    u16::from_le_bytes(block[off + 4..off + 6].try_into().unwrap()) as usize;
                off += rec_len;
            }
            assert_eq!(off, bs as usize);
        }
    }

    #[test]
    fn test_tampered_inode_is_detected() {
        let mut fs = fresh_fs();
        let mut file = fs
            .open_file("/victim.txt", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(b"payload").unwrap();
        file.close();
        fs.open_file("/innocent.txt", OpenFlags::CREATE)
            .unwrap()
            .close();

        let victim = fs.stat("/victim.txt").unwrap().inode;
        let location = fs.inode_location(victim).unwrap();
        let mut dev = fs.close();
        // flip one bit of the victim's atime
        dev.get_mut()[location as usize + 8] ^= 0x01;

        let mut fs = Ext4Fs::open(dev, 0, 0, 0).unwrap();
        let err = fs.stat("/victim.txt").unwrap_err();
        match err {
            Ext4Error::ChecksumMismatch { object, index } => {
                assert_eq!(object, "inode");
                assert_eq!(index, victim as u64);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        // only the tampered inode is affected
        assert!(fs.stat("/innocent.txt").is_ok());
    }

    #[test]
    fn test_mutations_keep_checksums_valid_after_reopen() {
        let mut fs = fresh_fs();
        fs.mkdir("/etc", 0o755).unwrap();
        let mut file = fs
            .open_file("/etc/conf", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write_all(b"key = value\n").unwrap();
        file.close();
        fs.mkdir("/newdir", 0o755).unwrap();

        // a fresh open re-verifies the superblock, descriptors, inodes and
        // directory blocks along every path we touch
        let mut fs = reopen(fs);
        assert!(fs.read_dir("/").is_ok());
        assert!(fs.read_dir("/etc").is_ok());
        assert!(fs.read_dir("/newdir").is_ok());
        let mut file = fs.open_file("/etc/conf", OpenFlags::READ).unwrap();
        let mut back = String::new();
        file.read_to_string(&mut back).unwrap();
        assert_eq!(back, "key = value\n");
    }
}
