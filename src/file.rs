//! Positioned reader/writer over one inode, backed by the extent tree and the
//! block allocator.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::device::ByteDevice;
use crate::error::{Ext4Error, Result};
use crate::ext4_h::Ext4Inode;
use crate::{unix_now, Ext4Fs};

/// An open file. Holds a mutable borrow of the engine for its whole lifetime;
/// every write goes straight to the device with the inode metadata refreshed.
#[derive(Debug)]
pub struct File<'fs, D: ByteDevice> {
    pub(crate) fs: &'fs mut Ext4Fs<D>,
    pub(crate) num: u32,
    pub(crate) inode: Ext4Inode,
    pub(crate) pos: u64,
}

impl<'fs, D: ByteDevice> File<'fs, D> {
    pub fn inode_num(&self) -> u32 {
        self.num
    }

    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    /// All metadata is already on the device; closing only releases the
    /// borrow of the engine.
    pub fn close(self) {}

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.inode.size();
        if self.pos >= size {
            return Ok(0);
        }
        let bs = self.fs.block_size();
        let total = (buf.len() as u64).min(size - self.pos) as usize;
        let mut done = 0;
        while done < total {
            let lblock = self.pos / bs;
            let in_block = self.pos % bs;
            let chunk = ((bs - in_block) as usize).min(total - done);
            let dest = &mut buf[done..done + chunk];
            match self.fs.map_file_block(self.num, &self.inode, lblock)? {
                Some(phys) => self.fs.vol.read_at(phys * bs + in_block, dest)?,
                None => dest.fill(0),
            }
            self.pos += chunk as u64;
            done += chunk;
        }
        Ok(total)
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.fs.block_size();
        let mut done = 0;
        while done < buf.len() {
            let lblock = self.pos / bs;
            let in_block = self.pos % bs;
            let chunk = ((bs - in_block) as usize).min(buf.len() - done);
            let phys = match self.fs.map_file_block(self.num, &self.inode, lblock)? {
                Some(phys) => phys,
                None => {
                    self.extend(lblock, in_block, (buf.len() - done) as u64)?;
                    continue;
                }
            };
            self.fs
                .vol
                .write_at(phys * bs + in_block, &buf[done..done + chunk])?;
            self.pos += chunk as u64;
            done += chunk;
        }

        if self.pos > self.inode.size() {
            self.inode.set_size(self.pos);
        }
        self.inode.i_mtime = unix_now();
        self.inode.i_ctime = self.inode.i_mtime;
        self.fs.write_inode(self.num, &mut self.inode)?;
        Ok(buf.len())
    }

    /// Map `lblock` by allocating a run covering as much of the remaining
    /// write as one group offers. Blocks the write only partially covers are
    /// zeroed so stale device content never shows through.
    fn extend(&mut self, lblock: u64, in_block: u64, remaining: u64) -> Result<()> {
        let bs = self.fs.block_size();
        let wanted = (in_block + remaining).div_ceil(bs);
        let (start, got) = self.fs.get_free_blocks(wanted)?;
        if let Err(err) = crate::extent::append_to_root(&mut self.inode.i_block, lblock, start, got)
        {
            // hand the run back before surfacing the failure
            self.fs.free_blocks(start, got)?;
            return Err(err);
        }
        self.inode.set_blocks(self.inode.blocks() + got * bs / 512);

        let zero = vec![0u8; bs as usize];
        if in_block != 0 {
            self.fs.vol.write_at(start * bs, &zero)?;
        }
        let write_end = in_block + remaining;
        if got == wanted && write_end % bs != 0 {
            self.fs.vol.write_at((start + got - 1) * bs, &zero)?;
        }
        Ok(())
    }

    /// Seeking past the end is legal; the file only grows on a later write.
    fn seek_inner(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.inode.size().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            Ext4Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))
        })?;
        self.pos = target;
        Ok(self.pos)
    }
}

impl<'fs, D: ByteDevice> Read for File<'fs, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(io::Error::from)
    }
}

impl<'fs, D: ByteDevice> Write for File<'fs, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'fs, D: ByteDevice> Seek for File<'fs, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_inner(pos).map_err(io::Error::from)
    }
}
