//! Per-open-directory entry buffering.
//!
//! A directory read is served from a growable byte buffer of serialized
//! entries, filled lazily by the user's `readdir` callback through a
//! [`DirFiller`]. Two fill modes exist: callers that supply their own
//! offsets stream straight into the kernel's window (the buffer is then
//! invalid for later offsets and refilled per request), callers that pass
//! offset 0 accumulate the whole directory once and later reads slice it.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::error::Errno;
use crate::ops::{FileAttr, FileInfo};
use crate::proto::abi::{self, DIRENT_NAME_OFFSET, NAME_MAX, dirent_align};
use crate::tree::{NodeId, NodeTable};

/// State of one open directory, owned by the dispatcher's handle table.
pub(crate) struct DirHandle {
    /// Directory node, recorded when readdir entries may need inode
    /// enrichment from the node table.
    pub node: Option<NodeId>,
    /// The user's per-open state from `opendir`.
    pub fi: FileInfo,
    /// Serializes fill/slice over a single directory-read stream.
    pub buf: Mutex<DirBuffer>,
}

impl DirHandle {
    pub fn new(node: Option<NodeId>, fi: FileInfo) -> Self {
        Self {
            node,
            fi,
            buf: Mutex::new(DirBuffer::default()),
        }
    }
}

/// Accumulated directory entries in wire form.
#[derive(Default)]
pub struct DirBuffer {
    contents: BytesMut,
    /// True when the buffer holds the whole directory and later offsets may
    /// be sliced from it; false when the last fill streamed a window.
    filled: bool,
    /// Size of the window the kernel asked for, bounding streaming fills.
    needlen: usize,
    error: Option<Errno>,
}

impl DirBuffer {
    /// Prepares for a fresh fill against a `needlen`-byte kernel window.
    pub fn reset(&mut self, needlen: usize) {
        self.contents.clear();
        self.filled = true;
        self.needlen = needlen;
        self.error = None;
    }

    /// Error recorded by the fill callback, if any.
    #[must_use]
    pub fn take_error(&mut self) -> Option<Errno> {
        self.error.take()
    }

    /// Marks the buffer as needing a refill on the next read.
    pub fn invalidate(&mut self) {
        self.filled = false;
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.filled
    }

    /// The reply bytes for a read at `offset`: a slice of the accumulated
    /// directory in all-at-once mode, the whole buffer in streaming mode.
    #[must_use]
    pub fn window(&self, offset: u64, size: u32) -> &[u8] {
        if self.filled {
            let len = self.contents.len() as u64;
            if offset >= len {
                return &[];
            }
            let end = (offset + u64::from(size)).min(len);
            &self.contents[offset as usize..end as usize]
        } else {
            &self.contents
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// The fill callback handed to the user's `readdir`.
///
/// Each [`push`](Self::push) serializes one entry. The return value is true
/// when iteration should stop: the kernel's window is full (streaming mode)
/// or the entry was unusable.
pub struct DirFiller<'a> {
    buf: &'a mut DirBuffer,
    nodes: &'a Mutex<NodeTable>,
    dir: Option<NodeId>,
    use_ino: bool,
    readdir_ino: bool,
    compat5: bool,
}

impl<'a> DirFiller<'a> {
    pub(crate) fn new(
        buf: &'a mut DirBuffer,
        nodes: &'a Mutex<NodeTable>,
        dir: Option<NodeId>,
        use_ino: bool,
        readdir_ino: bool,
        compat5: bool,
    ) -> Self {
        Self {
            buf,
            nodes,
            dir,
            use_ino,
            readdir_ino,
            compat5,
        }
    }

    /// Appends one entry.
    ///
    /// `offset` zero selects all-at-once mode; a nonzero value is the
    /// caller's own cursor for this entry and switches the stream to
    /// windowed mode. Returns true when the caller should stop iterating.
    pub fn push(&mut self, name: &OsStr, attr: Option<&FileAttr>, offset: u64) -> bool {
        let mut ino = attr.map_or(u64::MAX, |a| a.ino);
        let type_bits = attr.map_or(0, FileAttr::type_bits);

        if !self.use_ino {
            ino = u64::MAX;
            if self.readdir_ino
                && let Some(dir) = self.dir
                && let Some(id) = self.nodes.lock().lookup_id(dir, name)
            {
                ino = id;
            }
        }

        let bytes = name.as_bytes();
        if bytes.is_empty() {
            self.buf.error = Some(Errno::IO);
            return true;
        }
        let namelen = bytes.len().min(NAME_MAX);

        let name_offset = if self.compat5 {
            abi::compat5::DIRENT_NAME_OFFSET
        } else {
            DIRENT_NAME_OFFSET
        };
        let entlen = name_offset + namelen;
        let entsize = dirent_align(entlen);
        let newlen = self.buf.contents.len() + entsize;

        // Caller-supplied offsets mean the buffer only ever holds this one
        // window; stop once the kernel's request is satisfied. The legacy
        // major has no offset field and always accumulates everything.
        if offset != 0 && !self.compat5 {
            self.buf.filled = false;
            if newlen > self.buf.needlen {
                return true;
            }
        }

        let contents = &mut self.buf.contents;
        contents.reserve(entsize);
        contents.put_u64_ne(ino);
        if !self.compat5 {
            contents.put_u64_ne(if offset != 0 { offset } else { newlen as u64 });
        }
        contents.put_u32_ne(namelen as u32);
        contents.put_u32_ne(type_bits);
        contents.put_slice(&bytes[..namelen]);
        contents.put_bytes(0, entsize - entlen);
        false
    }
}
