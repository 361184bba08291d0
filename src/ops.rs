//! The user-facing capability table and the value types it trades in.
//!
//! Filesystem implementations are written against pathnames: the dispatch
//! core reconstructs an absolute path for every kernel request and hands it
//! to one of the optional callback slots below. An absent slot is observable
//! behavior, not a default: the kernel sees `ENOSYS` for that operation.

use std::cell::RefCell;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::dir::DirFiller;
use crate::error::OpResult;

/// File attributes as reported by the user's `getattr`.
///
/// Timestamps are wall-clock; pre-epoch values are clamped to the epoch on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Full `st_mode`, including the `S_IFMT` file type bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl FileAttr {
    /// The directory entry type nibble derived from the mode.
    #[must_use]
    pub fn type_bits(&self) -> u32 {
        (self.mode & libc::S_IFMT) >> 12
    }
}

impl Default for FileAttr {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            mode: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
        }
    }
}

/// Per-open state shared between the kernel and the user callbacks.
///
/// `open`/`opendir` may store an arbitrary handle in `fh`; it is carried in
/// every subsequent request against that open and handed back to
/// `read`/`write`/`flush`/`release` and the directory counterparts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Open flags (`O_RDONLY` and friends).
    pub flags: i32,
    /// User-chosen file handle.
    pub fh: u64,
    /// Set when a write originates from the page cache rather than an
    /// explicit `write(2)`.
    pub writepage: bool,
}

/// Filesystem statistics for `statfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statfs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Identity of the process whose syscall produced the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

thread_local! {
    static CONTEXT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// The identity behind the request currently being dispatched on this
/// thread, or `None` outside a callback.
#[must_use]
pub fn current_context() -> Option<RequestContext> {
    CONTEXT.with(|c| *c.borrow())
}

/// Scoped setter for [`current_context`]; clears on drop.
pub(crate) struct ContextGuard;

impl ContextGuard {
    pub(crate) fn set(ctx: RequestContext) -> Self {
        CONTEXT.with(|c| *c.borrow_mut() = Some(ctx));
        Self
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|c| *c.borrow_mut() = None);
    }
}

pub type GetattrFn = Box<dyn Fn(&Path) -> OpResult<FileAttr> + Send + Sync>;
pub type ReadlinkFn = Box<dyn Fn(&Path) -> OpResult<PathBuf> + Send + Sync>;
pub type MknodFn = Box<dyn Fn(&Path, u32, u64) -> OpResult<()> + Send + Sync>;
pub type MkdirFn = Box<dyn Fn(&Path, u32) -> OpResult<()> + Send + Sync>;
pub type RemoveFn = Box<dyn Fn(&Path) -> OpResult<()> + Send + Sync>;
/// `symlink(target, linkpath)`, in that order.
pub type SymlinkFn = Box<dyn Fn(&Path, &Path) -> OpResult<()> + Send + Sync>;
pub type RenameFn = Box<dyn Fn(&Path, &Path) -> OpResult<()> + Send + Sync>;
pub type LinkFn = Box<dyn Fn(&Path, &Path) -> OpResult<()> + Send + Sync>;
pub type ChmodFn = Box<dyn Fn(&Path, u32) -> OpResult<()> + Send + Sync>;
/// `None` for an id means "leave unchanged".
pub type ChownFn = Box<dyn Fn(&Path, Option<u32>, Option<u32>) -> OpResult<()> + Send + Sync>;
pub type TruncateFn = Box<dyn Fn(&Path, u64) -> OpResult<()> + Send + Sync>;
pub type UtimeFn = Box<dyn Fn(&Path, SystemTime, SystemTime) -> OpResult<()> + Send + Sync>;
pub type OpenFn = Box<dyn Fn(&Path, &mut FileInfo) -> OpResult<()> + Send + Sync>;
/// Fills the buffer from `offset`, returning the number of bytes produced.
pub type ReadFn = Box<dyn Fn(&Path, &mut [u8], u64, &FileInfo) -> OpResult<usize> + Send + Sync>;
pub type WriteFn = Box<dyn Fn(&Path, &[u8], u64, &FileInfo) -> OpResult<usize> + Send + Sync>;
pub type StatfsFn = Box<dyn Fn(&Path) -> OpResult<Statfs> + Send + Sync>;
pub type FlushFn = Box<dyn Fn(&Path, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type ReleaseFn = Box<dyn Fn(&Path, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type FsyncFn = Box<dyn Fn(&Path, bool, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type SetxattrFn = Box<dyn Fn(&Path, &OsStr, &[u8], i32) -> OpResult<()> + Send + Sync>;
/// An empty destination buffer is a size probe; either way the callback
/// returns the attribute's full length.
pub type GetxattrFn = Box<dyn Fn(&Path, &OsStr, &mut [u8]) -> OpResult<usize> + Send + Sync>;
pub type ListxattrFn = Box<dyn Fn(&Path, &mut [u8]) -> OpResult<usize> + Send + Sync>;
pub type RemovexattrFn = Box<dyn Fn(&Path, &OsStr) -> OpResult<()> + Send + Sync>;
pub type OpendirFn = Box<dyn Fn(&Path, &mut FileInfo) -> OpResult<()> + Send + Sync>;
pub type ReaddirFn =
    Box<dyn Fn(&Path, &mut DirFiller<'_>, u64, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type ReleasedirFn = Box<dyn Fn(&Path, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type FsyncdirFn = Box<dyn Fn(&Path, bool, &FileInfo) -> OpResult<()> + Send + Sync>;
pub type InitFn = Box<dyn Fn() + Send + Sync>;
pub type DestroyFn = Box<dyn Fn() + Send + Sync>;

/// The capability table: one optional slot per pathname operation.
///
/// Supplied once at session construction and never mutated. Any slot may be
/// `None`; the dispatcher replies `ENOSYS` for requests that need it (with
/// the exceptions called out on the individual handlers, e.g. `statfs`
/// falls back to defaults and `opendir` is a pure handle allocation).
#[derive(Default)]
pub struct Operations {
    pub getattr: Option<GetattrFn>,
    pub readlink: Option<ReadlinkFn>,
    pub mknod: Option<MknodFn>,
    pub mkdir: Option<MkdirFn>,
    pub unlink: Option<RemoveFn>,
    pub rmdir: Option<RemoveFn>,
    pub symlink: Option<SymlinkFn>,
    pub rename: Option<RenameFn>,
    pub link: Option<LinkFn>,
    pub chmod: Option<ChmodFn>,
    pub chown: Option<ChownFn>,
    pub truncate: Option<TruncateFn>,
    pub utime: Option<UtimeFn>,
    pub open: Option<OpenFn>,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub statfs: Option<StatfsFn>,
    pub flush: Option<FlushFn>,
    pub release: Option<ReleaseFn>,
    pub fsync: Option<FsyncFn>,
    pub setxattr: Option<SetxattrFn>,
    pub getxattr: Option<GetxattrFn>,
    pub listxattr: Option<ListxattrFn>,
    pub removexattr: Option<RemovexattrFn>,
    pub opendir: Option<OpendirFn>,
    pub readdir: Option<ReaddirFn>,
    pub releasedir: Option<ReleasedirFn>,
    pub fsyncdir: Option<FsyncdirFn>,
    pub init: Option<InitFn>,
    pub destroy: Option<DestroyFn>,
}

impl std::fmt::Debug for Operations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operations").finish_non_exhaustive()
    }
}
