use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Ext4Error>;

/// Errors surfaced by the engine.
///
/// Every fallible operation reports its first error and issues no further writes in
/// that call. Writes already submitted stay on the device; there is no rollback.
#[derive(Debug, Error)]
pub enum Ext4Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The superblock does not start with 0xEF53. Fatal on open.
    #[error("bad superblock magic {found:#06x}, expected 0xef53")]
    BadMagic { found: u16 },

    /// An incompat feature bit is set that this engine does not implement, or an
    /// operation needs one it cannot honour (e.g. mutating a hash-tree directory).
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// No group has a free inode or the requested free-block run.
    #[error("no space left on volume")]
    NoSpace,

    /// A metadata object's stored checksum disagrees with the computed value.
    /// Callers should treat the volume as suspect.
    #[error("checksum mismatch in {object} {index}")]
    ChecksumMismatch { object: &'static str, index: u64 },

    /// The file would outgrow the inline extent root.
    #[error("file too large for the inline extent tree")]
    FileTooLarge,

    /// A structural invariant of the on-disk format does not hold.
    #[error("corrupt volume: {0}")]
    Corrupt(String),
}

impl From<binrw::Error> for Ext4Error {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(io) => Ext4Error::Io(io),
            other => Ext4Error::Corrupt(other.to_string()),
        }
    }
}

impl From<Ext4Error> for io::Error {
    fn from(err: Ext4Error) -> Self {
        match err {
            Ext4Error::Io(io) => io,
            other => io::Error::other(other),
        }
    }
}
