#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Shared scaffolding for the wire-level tests: a scripted mock callback
//! table over a single piece of shared state, an in-memory channel that
//! records replies, and raw request-frame builders.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, IoSlice};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use pathfuse::{Channel, Errno, FileAttr, Operations};

/// Installs a fmt subscriber honoring `RUST_LOG`, once per test binary.
/// Run tests with `RUST_LOG=pathfuse=trace` to watch the dispatcher work.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── In-memory channel ───────────────────────────────────────────────────

/// Collects reply frames; can be told to fail the next send with a given
/// errno, which is how kernel-side request abortion manifests.
#[derive(Default)]
pub struct TestChannel {
    replies: Mutex<Vec<Vec<u8>>>,
    fail_next_send: Mutex<Option<i32>>,
}

impl TestChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_send(&self, errno: i32) {
        *self.fail_next_send.lock() = Some(errno);
    }

    pub fn take_replies(&self) -> Vec<Reply> {
        self.replies.lock().drain(..).map(Reply::parse).collect()
    }

    pub fn last_reply(&self) -> Reply {
        let replies = self.replies.lock();
        Reply::parse(replies.last().expect("no reply recorded").clone())
    }
}

impl Channel for TestChannel {
    fn receive(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::ENODEV))
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        if let Some(errno) = self.fail_next_send.lock().take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let mut frame = Vec::new();
        for buf in bufs {
            frame.extend_from_slice(buf);
        }
        self.replies.lock().push(frame);
        Ok(())
    }
}

/// A parsed reply frame.
#[derive(Debug, Clone)]
pub struct Reply {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
    pub body: Vec<u8>,
}

impl Reply {
    fn parse(frame: Vec<u8>) -> Self {
        assert!(frame.len() >= 16, "reply shorter than its header");
        Self {
            len: u32::from_ne_bytes(frame[0..4].try_into().unwrap()),
            error: i32::from_ne_bytes(frame[4..8].try_into().unwrap()),
            unique: u64::from_ne_bytes(frame[8..16].try_into().unwrap()),
            body: frame[16..].to_vec(),
        }
    }

    /// Node id from an entry reply body.
    pub fn entry_nodeid(&self) -> u64 {
        u64::from_ne_bytes(self.body[0..8].try_into().unwrap())
    }

    /// Generation from an entry reply body.
    pub fn entry_generation(&self) -> u64 {
        u64::from_ne_bytes(self.body[8..16].try_into().unwrap())
    }

    /// File handle from an open/opendir reply body.
    pub fn open_fh(&self) -> u64 {
        u64::from_ne_bytes(self.body[0..8].try_into().unwrap())
    }
}

/// One directory entry parsed from a readdir reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDirent {
    pub ino: u64,
    pub off: u64,
    pub name: String,
}

/// Parses the packed dirent stream of a readdir reply.
pub fn parse_dirents(body: &[u8]) -> Vec<WireDirent> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + 24 <= body.len() {
        let ino = u64::from_ne_bytes(body[pos..pos + 8].try_into().unwrap());
        let off = u64::from_ne_bytes(body[pos + 8..pos + 16].try_into().unwrap());
        let namelen = u32::from_ne_bytes(body[pos + 16..pos + 20].try_into().unwrap()) as usize;
        let name = String::from_utf8(body[pos + 24..pos + 24 + namelen].to_vec()).unwrap();
        entries.push(WireDirent { ino, off, name });
        pos += (24 + namelen + 7) & !7;
    }
    entries
}

// ── Request frames ──────────────────────────────────────────────────────

pub fn owner_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

/// Builds one framed request with the modern 40-byte header.
pub fn frame_as(opcode: u32, unique: u64, nodeid: u64, uid: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40 + body.len());
    buf.extend_from_slice(&((40 + body.len()) as u32).to_ne_bytes());
    buf.extend_from_slice(&opcode.to_ne_bytes());
    buf.extend_from_slice(&unique.to_ne_bytes());
    buf.extend_from_slice(&nodeid.to_ne_bytes());
    buf.extend_from_slice(&uid.to_ne_bytes());
    buf.extend_from_slice(&uid.to_ne_bytes()); // gid
    buf.extend_from_slice(&1u32.to_ne_bytes()); // pid
    buf.extend_from_slice(&0u32.to_ne_bytes()); // padding
    buf.extend_from_slice(body);
    buf
}

pub fn frame(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> Vec<u8> {
    frame_as(opcode, unique, nodeid, owner_uid(), body)
}

pub fn init_frame(unique: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&7u32.to_ne_bytes());
    body.extend_from_slice(&2u32.to_ne_bytes());
    frame(26, unique, 0, &body)
}

pub fn lookup_frame(unique: u64, parent: u64, name: &str) -> Vec<u8> {
    let mut body = name.as_bytes().to_vec();
    body.push(0);
    frame(1, unique, parent, &body)
}

pub fn forget_frame(unique: u64, nodeid: u64, nlookup: u64) -> Vec<u8> {
    frame(2, unique, nodeid, &nlookup.to_ne_bytes())
}

pub fn getattr_frame(unique: u64, nodeid: u64) -> Vec<u8> {
    frame(3, unique, nodeid, &[])
}

/// Attr block for a setattr body, zeroed apart from mode and size.
fn wire_attr(mode: u32, size: u64) -> [u8; 80] {
    let mut attr = [0u8; 80];
    attr[8..16].copy_from_slice(&size.to_ne_bytes());
    attr[60..64].copy_from_slice(&mode.to_ne_bytes());
    attr
}

pub fn setattr_frame(unique: u64, nodeid: u64, valid: u32, mode: u32, size: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&valid.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    body.extend_from_slice(&wire_attr(mode, size));
    frame(4, unique, nodeid, &body)
}

pub fn mknod_frame(unique: u64, parent: u64, name: &str, mode: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&mode.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes()); // rdev
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    frame(8, unique, parent, &body)
}

pub fn mkdir_frame(unique: u64, parent: u64, name: &str, mode: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&mode.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    frame(9, unique, parent, &body)
}

pub fn unlink_frame(unique: u64, parent: u64, name: &str) -> Vec<u8> {
    let mut body = name.as_bytes().to_vec();
    body.push(0);
    frame(10, unique, parent, &body)
}

pub fn rename_frame(unique: u64, olddir: u64, newdir: u64, old: &str, new: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&newdir.to_ne_bytes());
    body.extend_from_slice(old.as_bytes());
    body.push(0);
    body.extend_from_slice(new.as_bytes());
    body.push(0);
    frame(12, unique, olddir, &body)
}

pub fn open_frame(unique: u64, nodeid: u64, flags: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    frame(14, unique, nodeid, &body)
}

pub fn release_frame(unique: u64, nodeid: u64, fh: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&fh.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    frame(18, unique, nodeid, &body)
}

pub fn opendir_frame(unique: u64, nodeid: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    frame(27, unique, nodeid, &body)
}

pub fn readdir_frame(unique: u64, nodeid: u64, fh: u64, offset: u64, size: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&fh.to_ne_bytes());
    body.extend_from_slice(&offset.to_ne_bytes());
    body.extend_from_slice(&size.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    frame(28, unique, nodeid, &body)
}

pub fn releasedir_frame(unique: u64, nodeid: u64, fh: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&fh.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes());
    frame(29, unique, nodeid, &body)
}

// ── Mock filesystem ─────────────────────────────────────────────────────

pub fn file_attr() -> FileAttr {
    FileAttr {
        mode: libc::S_IFREG | 0o644,
        size: 5,
        ..FileAttr::default()
    }
}

pub fn dir_attr() -> FileAttr {
    FileAttr {
        mode: libc::S_IFDIR | 0o755,
        ..FileAttr::default()
    }
}

/// Backing state for the mock callback table. Mutating callbacks append to
/// `log` in invocation order.
#[derive(Default)]
pub struct MockState {
    pub attrs: HashMap<PathBuf, FileAttr>,
    pub listings: HashMap<PathBuf, Vec<String>>,
    pub log: Vec<String>,
    pub readdir_calls: usize,
    pub next_fh: u64,
    pub fail_chmod: Option<Errno>,
}

pub type SharedState = Arc<Mutex<MockState>>;

pub fn new_state() -> SharedState {
    let mut state = MockState::default();
    state.attrs.insert(PathBuf::from("/"), dir_attr());
    state.next_fh = 100;
    Arc::new(Mutex::new(state))
}

/// A full scripted callback table over `state`. Readdir streams with
/// caller-supplied offsets (entry-index cookies).
pub fn mock_ops(state: &SharedState) -> Operations {
    let mut ops = Operations::default();

    let st = Arc::clone(state);
    ops.getattr = Some(Box::new(move |path| {
        st.lock().attrs.get(path).copied().ok_or(Errno::NOENT)
    }));

    let st = Arc::clone(state);
    ops.mknod = Some(Box::new(move |path, mode, _rdev| {
        let mut st = st.lock();
        st.log.push(format!("mknod {}", path.display()));
        st.attrs.insert(
            path.to_path_buf(),
            FileAttr {
                mode,
                ..file_attr()
            },
        );
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.mkdir = Some(Box::new(move |path, _mode| {
        let mut st = st.lock();
        st.log.push(format!("mkdir {}", path.display()));
        st.attrs.insert(path.to_path_buf(), dir_attr());
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.unlink = Some(Box::new(move |path| {
        let mut st = st.lock();
        st.log.push(format!("unlink {}", path.display()));
        st.attrs.remove(path).map(|_| ()).ok_or(Errno::NOENT)
    }));

    let st = Arc::clone(state);
    ops.rmdir = Some(Box::new(move |path| {
        let mut st = st.lock();
        st.log.push(format!("rmdir {}", path.display()));
        st.attrs.remove(path).map(|_| ()).ok_or(Errno::NOENT)
    }));

    let st = Arc::clone(state);
    ops.rename = Some(Box::new(move |from, to| {
        let mut st = st.lock();
        st.log
            .push(format!("rename {} -> {}", from.display(), to.display()));
        let attr = st.attrs.remove(from).ok_or(Errno::NOENT)?;
        st.attrs.insert(to.to_path_buf(), attr);
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.chmod = Some(Box::new(move |path, mode| {
        let mut st = st.lock();
        if let Some(errno) = st.fail_chmod {
            st.log.push(format!("chmod-fail {}", path.display()));
            return Err(errno);
        }
        st.log.push(format!("chmod {} {mode:o}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.chown = Some(Box::new(move |path, uid, gid| {
        st.lock()
            .log
            .push(format!("chown {} {uid:?} {gid:?}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.truncate = Some(Box::new(move |path, size| {
        st.lock()
            .log
            .push(format!("truncate {} {size}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.utime = Some(Box::new(move |path, _atime, _mtime| {
        st.lock().log.push(format!("utime {}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.open = Some(Box::new(move |path, fi| {
        let mut st = st.lock();
        st.next_fh += 1;
        fi.fh = st.next_fh;
        st.log.push(format!("open {}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.release = Some(Box::new(move |path, _fi| {
        st.lock().log.push(format!("release {}", path.display()));
        Ok(())
    }));

    let st = Arc::clone(state);
    ops.read = Some(Box::new(move |path, buf, offset, _fi| {
        let st = st.lock();
        st.attrs.get(path).ok_or(Errno::NOENT)?;
        let data = b"hello";
        let start = (offset as usize).min(data.len());
        let count = data.len().saturating_sub(start).min(buf.len());
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }));

    let st = Arc::clone(state);
    ops.readdir = Some(Box::new(move |path, filler, offset, _fi| {
        let entries = {
            let mut st = st.lock();
            st.readdir_calls += 1;
            st.listings.get(path).cloned().ok_or(Errno::NOENT)?
        };
        for (i, name) in entries.iter().enumerate().skip(offset as usize) {
            let attr = FileAttr {
                ino: 1000 + i as u64,
                ..file_attr()
            };
            if filler.push(OsStr::new(name), Some(&attr), (i + 1) as u64) {
                break;
            }
        }
        Ok(())
    }));

    ops
}
