//! Raw wire layout of the kernel protocol.
//!
//! Requests arrive as a fixed header followed by opcode-specific bytes;
//! replies are a header optionally followed by a body. All structs are the
//! kernel's native-endian C layouts, derive-checked by `zerocopy` so no
//! pointer casting is involved. The `compat5` module carries the layouts
//! that differ under legacy protocol major 5.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Node id of the filesystem root, fixed by the protocol.
pub const ROOT_ID: u64 = 1;

/// Current protocol major supported by this crate.
pub const KERNEL_VERSION: u32 = 7;
/// Current protocol minor supported by this crate.
pub const KERNEL_MINOR_VERSION: u32 = 2;

/// Largest request frame the device will hand us.
pub const MAX_REQUEST_SIZE: usize = 8192;

/// Operation codes, numbered by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
}

impl Opcode {
    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Lookup,
            2 => Self::Forget,
            3 => Self::Getattr,
            4 => Self::Setattr,
            5 => Self::Readlink,
            6 => Self::Symlink,
            8 => Self::Mknod,
            9 => Self::Mkdir,
            10 => Self::Unlink,
            11 => Self::Rmdir,
            12 => Self::Rename,
            13 => Self::Link,
            14 => Self::Open,
            15 => Self::Read,
            16 => Self::Write,
            17 => Self::Statfs,
            18 => Self::Release,
            20 => Self::Fsync,
            21 => Self::Setxattr,
            22 => Self::Getxattr,
            23 => Self::Listxattr,
            24 => Self::Removexattr,
            25 => Self::Flush,
            26 => Self::Init,
            27 => Self::Opendir,
            28 => Self::Readdir,
            29 => Self::Releasedir,
            30 => Self::Fsyncdir,
            _ => return None,
        })
    }

    /// Kernel-side name, for traces.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Lookup => "LOOKUP",
            Self::Forget => "FORGET",
            Self::Getattr => "GETATTR",
            Self::Setattr => "SETATTR",
            Self::Readlink => "READLINK",
            Self::Symlink => "SYMLINK",
            Self::Mknod => "MKNOD",
            Self::Mkdir => "MKDIR",
            Self::Unlink => "UNLINK",
            Self::Rmdir => "RMDIR",
            Self::Rename => "RENAME",
            Self::Link => "LINK",
            Self::Open => "OPEN",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Statfs => "STATFS",
            Self::Release => "RELEASE",
            Self::Fsync => "FSYNC",
            Self::Setxattr => "SETXATTR",
            Self::Getxattr => "GETXATTR",
            Self::Listxattr => "LISTXATTR",
            Self::Removexattr => "REMOVEXATTR",
            Self::Flush => "FLUSH",
            Self::Init => "INIT",
            Self::Opendir => "OPENDIR",
            Self::Readdir => "READDIR",
            Self::Releasedir => "RELEASEDIR",
            Self::Fsyncdir => "FSYNCDIR",
        }
    }
}

/// `fuse_in_header`: prefix of every request.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

impl InHeader {
    pub const SIZE: usize = size_of::<Self>();
}

/// `fuse_out_header`: prefix of every reply.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

impl OutHeader {
    pub const SIZE: usize = size_of::<Self>();
}

/// `fuse_attr`: attribute block embedded in entry and attr replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

/// `fuse_kstatfs` wrapped in `fuse_statfs_out`.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// `fuse_entry_out`: reply to the lookup family.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

/// `fuse_attr_out`: reply to getattr/setattr.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ForgetIn {
    /// Lookup count to release; under legacy majors this slot carries the
    /// last-seen request id instead.
    pub nlookup: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MknodIn {
    pub mode: u32,
    pub rdev: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MkdirIn {
    pub mode: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RenameIn {
    pub newdir: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LinkIn {
    pub oldnodeid: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SetattrIn {
    pub valid: u32,
    pub padding: u32,
    pub attr: Attr,
}

bitflags! {
    /// Which attribute fields a SETATTR request wants applied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetattrValid: u32 {
        const MODE  = 1 << 0;
        const UID   = 1 << 1;
        const GID   = 1 << 2;
        const SIZE  = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpenIn {
    pub flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlushIn {
    pub fh: u64,
    pub flush_flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FsyncIn {
    pub fh: u64,
    pub fsync_flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SetxattrIn {
    pub size: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetxattrIn {
    pub size: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetxattrOut {
    pub size: u32,
    pub padding: u32,
}

/// `fuse_init_in_out`: the handshake body, identical in both directions.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InitInOut {
    pub major: u32,
    pub minor: u32,
}

/// Byte offset of the name field inside a serialized `fuse_dirent`.
pub const DIRENT_NAME_OFFSET: usize = 24;

/// Directory entries are padded to this alignment in the reply stream.
pub const DIRENT_ALIGN: usize = 8;

/// Longest directory entry name the wire format carries.
pub const NAME_MAX: usize = 255;

#[must_use]
pub fn dirent_align(len: usize) -> usize {
    (len + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}

/// Layouts that differ under legacy protocol major 5. The request header
/// loses its trailing padding word, bodies that follow a shrunken struct
/// shift by one word, and several replies are truncated by one word.
pub mod compat5 {
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    /// `fuse_in_header` without the trailing padding word.
    pub const IN_HEADER_SIZE: usize = 36;

    /// `fuse_mkdir_in` is a bare mode word.
    #[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    pub struct MkdirIn {
        pub mode: u32,
    }

    /// Offset of the attr block inside `fuse_setattr_in` (no padding word).
    pub const SETATTR_ATTR_OFFSET: usize = 4;

    /// Reply sizes truncated by the missing trailing word.
    pub const OPEN_OUT_SIZE: usize = 12;
    pub const WRITE_OUT_SIZE: usize = 4;
    pub const GETXATTR_OUT_SIZE: usize = 4;

    /// Byte offset of the name field inside the off-less legacy dirent.
    pub const DIRENT_NAME_OFFSET: usize = 16;
}
