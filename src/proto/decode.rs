//! Decoding of framed requests into normalized, version-independent shapes.
//!
//! Layout differences between the current major and legacy major 5 are
//! resolved here, once, so the dispatcher never switches on field offsets.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;
use zerocopy::FromBytes;

use super::ProtoVersion;
use super::abi::{
    self, Attr, FlushIn, ForgetIn, FsyncIn, GetxattrIn, InHeader, InitInOut, LinkIn, MkdirIn,
    MknodIn, OpenIn, Opcode, ReadIn, ReleaseIn, RenameIn, SetattrIn, SetxattrIn, WriteIn,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("request frame shorter than its header ({len} bytes)")]
    TruncatedHeader { len: usize },
    #[error("truncated {opcode} body")]
    TruncatedBody { opcode: &'static str },
    #[error("missing NUL terminator in {opcode} argument")]
    UnterminatedName { opcode: &'static str },
}

/// Normalized request header fields the dispatcher cares about.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Raw value of the padding slot, needed for the legacy init handshake.
    pub padding: u32,
}

/// One decoded request. Borrows names and data from the frame buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Lookup { name: &'a OsStr },
    Forget { nlookup: u64 },
    Getattr,
    Setattr { valid: u32, attr: Attr },
    Readlink,
    Symlink { name: &'a OsStr, target: &'a OsStr },
    Mknod { mode: u32, rdev: u32, name: &'a OsStr },
    Mkdir { mode: u32, name: &'a OsStr },
    Unlink { name: &'a OsStr },
    Rmdir { name: &'a OsStr },
    Rename { newdir: u64, name: &'a OsStr, newname: &'a OsStr },
    Link { oldnodeid: u64, name: &'a OsStr },
    Open { flags: u32 },
    Read { fh: u64, offset: u64, size: u32 },
    Write { fh: u64, offset: u64, data: &'a [u8], writepage: bool },
    Statfs,
    Release { fh: u64, flags: u32 },
    Fsync { fh: u64, datasync: bool },
    Setxattr { name: &'a OsStr, value: &'a [u8], flags: i32 },
    Getxattr { name: &'a OsStr, size: u32 },
    Listxattr { size: u32 },
    Removexattr { name: &'a OsStr },
    Flush { fh: u64 },
    Init { major: u32, minor: u32 },
    Opendir { flags: u32 },
    Readdir { fh: u64, offset: u64, size: u32 },
    Releasedir { fh: u64, flags: u32 },
    Fsyncdir { fh: u64, datasync: bool },
    /// Opcode this crate does not implement; answered with `ENOSYS`.
    Unsupported(u32),
}

/// Splits a frame into its header and opcode-specific remainder.
pub fn decode_header(
    buf: &[u8],
    version: ProtoVersion,
) -> Result<(RequestHeader, &[u8]), DecodeError> {
    let header_len = if version.is_compat5() {
        abi::compat5::IN_HEADER_SIZE
    } else {
        InHeader::SIZE
    };
    if buf.len() < header_len {
        return Err(DecodeError::TruncatedHeader { len: buf.len() });
    }

    // The legacy header is the modern one minus the trailing padding word,
    // so widen it with a zeroed tail and parse once.
    let header = if version.is_compat5() {
        let mut raw = [0u8; InHeader::SIZE];
        raw[..abi::compat5::IN_HEADER_SIZE].copy_from_slice(&buf[..abi::compat5::IN_HEADER_SIZE]);
        InHeader::read_from_bytes(&raw).unwrap_or_else(|_| unreachable!("fixed-size header"))
    } else {
        let (header, _) = InHeader::read_from_prefix(buf)
            .unwrap_or_else(|_| unreachable!("length checked above"));
        header
    };

    Ok((
        RequestHeader {
            opcode: header.opcode,
            unique: header.unique,
            nodeid: header.nodeid,
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
            padding: header.padding,
        },
        &buf[header_len..],
    ))
}

/// Decodes the opcode-specific remainder of a frame.
pub fn decode_body<'a>(
    header: &RequestHeader,
    body: &'a [u8],
    version: ProtoVersion,
) -> Result<Request<'a>, DecodeError> {
    let Some(opcode) = Opcode::from_u32(header.opcode) else {
        return Ok(Request::Unsupported(header.opcode));
    };
    let op = opcode.name();

    Ok(match opcode {
        Opcode::Lookup => Request::Lookup {
            name: nul_str(body, op)?.0,
        },
        Opcode::Forget => {
            let (arg, _) = read_struct::<ForgetIn>(body, op)?;
            Request::Forget {
                nlookup: arg.nlookup,
            }
        }
        Opcode::Getattr => Request::Getattr,
        Opcode::Setattr => {
            if version.is_compat5() {
                let (valid, _) = read_struct::<u32>(body, op)?;
                let rest = body
                    .get(abi::compat5::SETATTR_ATTR_OFFSET..)
                    .ok_or(DecodeError::TruncatedBody { opcode: op })?;
                let (attr, _) = read_struct::<Attr>(rest, op)?;
                Request::Setattr { valid, attr }
            } else {
                let (arg, _) = read_struct::<SetattrIn>(body, op)?;
                Request::Setattr {
                    valid: arg.valid,
                    attr: arg.attr,
                }
            }
        }
        Opcode::Readlink => Request::Readlink,
        Opcode::Symlink => {
            let (name, rest) = nul_str(body, op)?;
            let (target, _) = nul_str(rest, op)?;
            Request::Symlink { name, target }
        }
        Opcode::Mknod => {
            let (arg, rest) = read_struct::<MknodIn>(body, op)?;
            Request::Mknod {
                mode: arg.mode,
                rdev: arg.rdev,
                name: nul_str(rest, op)?.0,
            }
        }
        Opcode::Mkdir => {
            let (mode, rest) = if version.is_compat5() {
                let (arg, rest) = read_struct::<abi::compat5::MkdirIn>(body, op)?;
                (arg.mode, rest)
            } else {
                let (arg, rest) = read_struct::<MkdirIn>(body, op)?;
                (arg.mode, rest)
            };
            Request::Mkdir {
                mode,
                name: nul_str(rest, op)?.0,
            }
        }
        Opcode::Unlink => Request::Unlink {
            name: nul_str(body, op)?.0,
        },
        Opcode::Rmdir => Request::Rmdir {
            name: nul_str(body, op)?.0,
        },
        Opcode::Rename => {
            let (arg, rest) = read_struct::<RenameIn>(body, op)?;
            let (name, rest) = nul_str(rest, op)?;
            let (newname, _) = nul_str(rest, op)?;
            Request::Rename {
                newdir: arg.newdir,
                name,
                newname,
            }
        }
        Opcode::Link => {
            let (arg, rest) = read_struct::<LinkIn>(body, op)?;
            Request::Link {
                oldnodeid: arg.oldnodeid,
                name: nul_str(rest, op)?.0,
            }
        }
        Opcode::Open => {
            let (arg, _) = read_struct::<OpenIn>(body, op)?;
            Request::Open { flags: arg.flags }
        }
        Opcode::Read => {
            let (arg, _) = read_struct::<ReadIn>(body, op)?;
            Request::Read {
                fh: arg.fh,
                offset: arg.offset,
                size: arg.size,
            }
        }
        Opcode::Write => {
            let (arg, rest) = read_struct::<WriteIn>(body, op)?;
            let data = rest
                .get(..arg.size as usize)
                .ok_or(DecodeError::TruncatedBody { opcode: op })?;
            Request::Write {
                fh: arg.fh,
                offset: arg.offset,
                data,
                writepage: arg.write_flags & 1 != 0,
            }
        }
        Opcode::Statfs => Request::Statfs,
        Opcode::Release => {
            let (arg, _) = read_struct::<ReleaseIn>(body, op)?;
            Request::Release {
                fh: arg.fh,
                flags: arg.flags,
            }
        }
        Opcode::Fsync => {
            let (arg, _) = read_struct::<FsyncIn>(body, op)?;
            Request::Fsync {
                fh: arg.fh,
                datasync: arg.fsync_flags & 1 != 0,
            }
        }
        Opcode::Setxattr => {
            let (arg, rest) = read_struct::<SetxattrIn>(body, op)?;
            let (name, rest) = nul_str(rest, op)?;
            let value = rest
                .get(..arg.size as usize)
                .ok_or(DecodeError::TruncatedBody { opcode: op })?;
            Request::Setxattr {
                name,
                value,
                flags: arg.flags as i32,
            }
        }
        Opcode::Getxattr => {
            let (arg, rest) = read_struct::<GetxattrIn>(body, op)?;
            Request::Getxattr {
                name: nul_str(rest, op)?.0,
                size: arg.size,
            }
        }
        Opcode::Listxattr => {
            let (arg, _) = read_struct::<GetxattrIn>(body, op)?;
            Request::Listxattr { size: arg.size }
        }
        Opcode::Removexattr => Request::Removexattr {
            name: nul_str(body, op)?.0,
        },
        Opcode::Flush => {
            let (arg, _) = read_struct::<FlushIn>(body, op)?;
            Request::Flush { fh: arg.fh }
        }
        Opcode::Init => {
            let (arg, _) = read_struct::<InitInOut>(body, op)?;
            // A major-5 kernel has a header one word shorter, so its init
            // body shifts: its major lands in our padding slot and its
            // minor where we parse the major. Undo the transposition.
            if header.padding == 5 {
                Request::Init {
                    major: 5,
                    minor: arg.major,
                }
            } else {
                Request::Init {
                    major: arg.major,
                    minor: arg.minor,
                }
            }
        }
        Opcode::Opendir => {
            let (arg, _) = read_struct::<OpenIn>(body, op)?;
            Request::Opendir { flags: arg.flags }
        }
        Opcode::Readdir => {
            let (arg, _) = read_struct::<ReadIn>(body, op)?;
            Request::Readdir {
                fh: arg.fh,
                offset: arg.offset,
                size: arg.size,
            }
        }
        Opcode::Releasedir => {
            let (arg, _) = read_struct::<ReleaseIn>(body, op)?;
            Request::Releasedir {
                fh: arg.fh,
                flags: arg.flags,
            }
        }
        Opcode::Fsyncdir => {
            let (arg, _) = read_struct::<FsyncIn>(body, op)?;
            Request::Fsyncdir {
                fh: arg.fh,
                datasync: arg.fsync_flags & 1 != 0,
            }
        }
    })
}

fn nul_str<'a>(body: &'a [u8], opcode: &'static str) -> Result<(&'a OsStr, &'a [u8]), DecodeError> {
    let pos = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::UnterminatedName { opcode })?;
    Ok((OsStr::from_bytes(&body[..pos]), &body[pos + 1..]))
}

fn read_struct<'a, T: FromBytes>(
    body: &'a [u8],
    opcode: &'static str,
) -> Result<(T, &'a [u8]), DecodeError> {
    T::read_from_prefix(body).map_err(|_| DecodeError::TruncatedBody { opcode })
}
