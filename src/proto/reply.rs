//! Reply body construction and version-dependent reply sizing.

use std::time::{Duration, SystemTime};

use super::ProtoVersion;
use super::abi::{self, Attr, AttrOut, EntryOut, GetxattrOut, OpenOut, StatfsOut, WriteOut};
use crate::ops::{FileAttr, Statfs};

/// Advisory validity returned to the kernel for entry bindings.
pub const ENTRY_REVALIDATE_SECS: u64 = 1;
/// Advisory validity returned to the kernel for attributes.
pub const ATTR_REVALIDATE_SECS: u64 = 1;

fn timestamp(t: SystemTime) -> (u64, u32) {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        // The wire has no sign bit; clamp pre-epoch times.
        Err(_) => (0, 0),
    }
}

/// Converts a wire timestamp back into wall-clock time.
#[must_use]
pub fn systime(secs: u64, nsec: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::new(secs, nsec)
}

impl From<&FileAttr> for Attr {
    fn from(attr: &FileAttr) -> Self {
        let (atime, atimensec) = timestamp(attr.atime);
        let (mtime, mtimensec) = timestamp(attr.mtime);
        let (ctime, ctimensec) = timestamp(attr.ctime);
        Self {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
        }
    }
}

#[must_use]
pub fn entry_out(nodeid: u64, generation: u64, attr: Attr) -> EntryOut {
    EntryOut {
        nodeid,
        generation,
        entry_valid: ENTRY_REVALIDATE_SECS,
        attr_valid: ATTR_REVALIDATE_SECS,
        entry_valid_nsec: 0,
        attr_valid_nsec: 0,
        attr,
    }
}

#[must_use]
pub fn attr_out(attr: Attr) -> AttrOut {
    AttrOut {
        attr_valid: ATTR_REVALIDATE_SECS,
        attr_valid_nsec: 0,
        dummy: 0,
        attr,
    }
}

impl From<&Statfs> for StatfsOut {
    fn from(st: &Statfs) -> Self {
        Self {
            blocks: st.blocks,
            bfree: st.blocks_free,
            bavail: st.blocks_avail,
            files: st.files,
            ffree: st.files_free,
            bsize: st.block_size,
            namelen: st.name_max,
        }
    }
}

/// Bytes of an `OpenOut` actually sent under the negotiated version.
#[must_use]
pub fn open_out_len(version: ProtoVersion) -> usize {
    if version.is_compat5() {
        abi::compat5::OPEN_OUT_SIZE
    } else {
        size_of::<OpenOut>()
    }
}

/// Bytes of a `WriteOut` actually sent under the negotiated version.
#[must_use]
pub fn write_out_len(version: ProtoVersion) -> usize {
    if version.is_compat5() {
        abi::compat5::WRITE_OUT_SIZE
    } else {
        size_of::<WriteOut>()
    }
}

/// Bytes of a `GetxattrOut` actually sent under the negotiated version.
#[must_use]
pub fn getxattr_out_len(version: ProtoVersion) -> usize {
    if version.is_compat5() {
        abi::compat5::GETXATTR_OUT_SIZE
    } else {
        size_of::<GetxattrOut>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_epoch_times_clamp_to_zero() {
        let attr = FileAttr {
            atime: SystemTime::UNIX_EPOCH - Duration::from_secs(10),
            ..FileAttr::default()
        };
        let wire = Attr::from(&attr);
        assert_eq!((wire.atime, wire.atimensec), (0, 0));
    }

    #[test]
    fn entry_out_carries_advisory_ttls() {
        let out = entry_out(42, 3, Attr::default());
        assert_eq!(out.nodeid, 42);
        assert_eq!(out.generation, 3);
        assert_eq!(out.entry_valid, ENTRY_REVALIDATE_SECS);
        assert_eq!(out.attr_valid, ATTR_REVALIDATE_SECS);
    }

    #[test]
    fn legacy_replies_are_truncated_by_one_word() {
        let v5 = ProtoVersion { major: 5, minor: 1 };
        let v7 = ProtoVersion::default();
        assert_eq!(open_out_len(v5) + 4, open_out_len(v7));
        assert_eq!(write_out_len(v5) + 4, write_out_len(v7));
        assert_eq!(getxattr_out_len(v5) + 4, getxattr_out_len(v7));
    }
}
