//! Request dispatch: one decoded frame in, one framed reply out.
//!
//! Handlers follow a single pattern: take the tree lock (shared for
//! path-holding operations, exclusive for namespace mutations), reconstruct
//! the target path from the node table, invoke the user callback, drop the
//! lock, marshal and send. The tree lock is what keeps a reconstructed path
//! valid for the whole callback; the node-table mutex is only ever held for
//! short index updates, with one deliberate exception in `do_open` where it
//! pins the open count against a racing release until the reply is on the
//! wire.
//!
//! A reply write failing with `ENOENT` means the kernel aborted the request;
//! that is not an error but an instruction to compensate — forget a freshly
//! inserted node, release a freshly opened handle.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::config::MountOptions;
use crate::dir::{DirBuffer, DirFiller, DirHandle};
use crate::error::{Errno, OpResult};
use crate::ops::{ContextGuard, FileInfo, Operations, RequestContext, Statfs};
use crate::proto::ProtoState;
use crate::proto::ProtoVersion;
use crate::proto::abi::{
    self, Attr, EntryOut, GetxattrOut, InHeader, InitInOut, OpenOut, Opcode, OutHeader,
    SetattrValid, StatfsOut, WriteOut,
};
use crate::proto::decode::{Request, RequestHeader, decode_body, decode_header};
use crate::proto::reply::{self, attr_out, entry_out, systime};
use crate::session::Channel;
use crate::tree::{MAX_PATH, NodeId, NodeTable};

/// Attempts at finding an unused shadow name before giving up with `EBUSY`.
const HIDDEN_NAME_RETRIES: u32 = 10;

/// Availability bookkeeping for an external worker pool, behind its own
/// mutex so pool decisions never contend with the node table.
#[derive(Default)]
struct WorkerCounter {
    counts: Mutex<WorkerCounts>,
}

#[derive(Default, Clone, Copy)]
struct WorkerCounts {
    avail: isize,
    total: isize,
}

impl WorkerCounter {
    fn dec_avail(&self) {
        self.counts.lock().avail -= 1;
    }

    fn inc_avail(&self) {
        self.counts.lock().avail += 1;
    }
}

/// The request-dispatch core. `dispatch` is `&self` and may be driven from
/// any number of worker threads; the locking discipline above keeps it
/// coherent.
pub struct Dispatcher {
    ops: Operations,
    opts: MountOptions,
    /// Uid of the mount owner, for the `allow_root` gate.
    owner: u32,
    /// Guards the (parent, name) namespace against mutation while a
    /// reconstructed path is in a callback's hands.
    tree_lock: RwLock<()>,
    nodes: Mutex<NodeTable>,
    dirs: Mutex<FxHashMap<u64, Arc<DirHandle>>>,
    next_dir_fh: AtomicU64,
    proto: Mutex<ProtoState>,
    workers: WorkerCounter,
    exited: AtomicBool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(ops: Operations, opts: MountOptions) -> Self {
        Self {
            ops,
            opts,
            owner: nix::unistd::Uid::current().as_raw(),
            tree_lock: RwLock::new(()),
            nodes: Mutex::new(NodeTable::new()),
            dirs: Mutex::new(FxHashMap::default()),
            next_dir_fh: AtomicU64::new(1),
            proto: Mutex::new(ProtoState::default()),
            workers: WorkerCounter::default(),
            exited: AtomicBool::new(false),
        }
    }

    /// Requests loop termination; in-flight requests still complete.
    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Registers a worker with the availability counter.
    pub fn register_worker(&self) {
        let mut counts = self.workers.counts.lock();
        counts.total += 1;
        counts.avail += 1;
    }

    /// Workers currently not busy with a request.
    #[must_use]
    pub fn available_workers(&self) -> isize {
        self.workers.counts.lock().avail
    }

    #[must_use]
    pub fn worker_count(&self) -> isize {
        self.workers.counts.lock().total
    }

    /// Smallest frame the negotiated protocol can produce.
    pub(crate) fn min_request_len(&self) -> usize {
        if self.proto.lock().version.is_compat5() {
            abi::compat5::IN_HEADER_SIZE
        } else {
            InHeader::SIZE
        }
    }

    fn version(&self) -> ProtoVersion {
        self.proto.lock().version
    }

    fn path_of(&self, id: NodeId, name: Option<&OsStr>) -> Result<PathBuf, Errno> {
        self.nodes.lock().path_of(id, name)
    }

    // ── Reply plumbing ──────────────────────────────────────────────────

    /// Frames and writes one reply. The availability counter is bumped
    /// before the write so the pool sees this worker free even if the
    /// device write blocks.
    fn send(&self, ch: &dyn Channel, unique: u64, error: i32, body: &[u8]) -> Result<(), Errno> {
        let header = OutHeader {
            len: (OutHeader::SIZE + body.len()) as u32,
            error,
            unique,
        };
        if self.opts.debug() {
            debug!(unique, error, outsize = header.len, "reply");
        }

        self.workers.inc_avail();

        let iov = [
            std::io::IoSlice::new(header.as_bytes()),
            std::io::IoSlice::new(body),
        ];
        ch.send(&iov).map_err(|err| {
            let errno = Errno::from_io(&err);
            // ENOENT means the kernel aborted the request meanwhile.
            if !self.exited() && errno != Errno::NOENT {
                warn!(%err, "writing device");
            }
            errno
        })
    }

    fn send_error(&self, ch: &dyn Channel, unique: u64, errno: Errno) {
        let _ = self.send(ch, unique, errno.to_wire(), &[]);
    }

    fn send_empty(&self, ch: &dyn Channel, unique: u64, res: OpResult<()>) {
        match res {
            Ok(()) => {
                let _ = self.send(ch, unique, 0, &[]);
            }
            Err(errno) => self.send_error(ch, unique, errno),
        }
    }

    /// Sends an entry-family reply, issuing a compensating forget when the
    /// kernel aborted the request under us.
    fn send_entry(&self, ch: &dyn Channel, header: &RequestHeader, res: OpResult<EntryOut>) {
        match res {
            Ok(entry) => {
                if let Err(err) = self.send(ch, header.unique, 0, entry.as_bytes())
                    && err == Errno::NOENT
                {
                    self.cancel_lookup(entry.nodeid, header.unique);
                }
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn cancel_lookup(&self, id: NodeId, unique: u64) {
        let version = self.version();
        let mut nodes = self.nodes.lock();
        if version.has_forget_counts() {
            nodes.forget(id, 1);
        } else {
            nodes.forget_by_version(id, unique);
        }
    }

    // ── Entry point ─────────────────────────────────────────────────────

    /// Decodes and executes one request frame, writing the reply to `ch`.
    pub fn dispatch(&self, ch: &dyn Channel, buf: &[u8]) {
        let proto = *self.proto.lock();
        let (header, body) = match decode_header(buf, proto.version) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "dropping unparseable request");
                return;
            }
        };

        if self.opts.debug() {
            debug!(
                unique = header.unique,
                opcode = Opcode::from_u32(header.opcode).map_or("???", Opcode::name),
                raw_opcode = header.opcode,
                nodeid = header.nodeid,
                insize = buf.len(),
                "request"
            );
        }

        let span = tracing::debug_span!(
            "request",
            unique = header.unique,
            opcode = header.opcode,
            nodeid = header.nodeid
        );
        let _span = span.entered();

        let request = match decode_body(&header, body, proto.version) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, unique = header.unique, "malformed request body");
                self.workers.dec_avail();
                self.send_error(ch, header.unique, Errno::INVAL);
                return;
            }
        };

        // Forget has no reply and is processed inline, outside worker
        // accounting.
        if let Request::Forget { nlookup } = request {
            self.do_forget(&header, nlookup, proto.version);
            return;
        }

        self.workers.dec_avail();

        if !proto.initialized && !matches!(request, Request::Init { .. }) {
            // Nothing but the handshake is valid before the handshake.
            self.send_error(ch, header.unique, Errno::PROTO);
            return;
        }

        if self.opts.allow_root()
            && header.uid != self.owner
            && header.uid != 0
            && !matches!(
                request,
                Request::Init { .. }
                    | Request::Read { .. }
                    | Request::Write { .. }
                    | Request::Fsync { .. }
                    | Request::Release { .. }
                    | Request::Readdir { .. }
                    | Request::Fsyncdir { .. }
                    | Request::Releasedir { .. }
            )
        {
            self.send_error(ch, header.unique, Errno::ACCES);
            return;
        }

        let _ctx = ContextGuard::set(RequestContext {
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
        });

        match request {
            Request::Lookup { name } => self.do_lookup(ch, &header, name),
            Request::Forget { .. } => unreachable!("handled above"),
            Request::Getattr => self.do_getattr(ch, &header),
            Request::Setattr { valid, attr } => self.do_setattr(ch, &header, valid, &attr),
            Request::Readlink => self.do_readlink(ch, &header),
            Request::Symlink { name, target } => self.do_symlink(ch, &header, name, target),
            Request::Mknod { mode, rdev, name } => self.do_mknod(ch, &header, mode, rdev, name),
            Request::Mkdir { mode, name } => self.do_mkdir(ch, &header, mode, name),
            Request::Unlink { name } => self.do_unlink(ch, &header, name),
            Request::Rmdir { name } => self.do_rmdir(ch, &header, name),
            Request::Rename {
                newdir,
                name,
                newname,
            } => self.do_rename(ch, &header, newdir, name, newname),
            Request::Link { oldnodeid, name } => self.do_link(ch, &header, oldnodeid, name),
            Request::Open { flags } => self.do_open(ch, &header, flags),
            Request::Read { fh, offset, size } => self.do_read(ch, &header, fh, offset, size),
            Request::Write {
                fh,
                offset,
                data,
                writepage,
            } => self.do_write(ch, &header, fh, offset, data, writepage),
            Request::Statfs => self.do_statfs(ch, &header),
            Request::Release { fh, flags } => self.do_release(ch, &header, fh, flags),
            Request::Fsync { fh, datasync } => self.do_fsync(ch, &header, fh, datasync),
            Request::Setxattr { name, value, flags } => {
                self.do_setxattr(ch, &header, name, value, flags);
            }
            Request::Getxattr { name, size } => self.do_getxattr(ch, &header, name, size),
            Request::Listxattr { size } => self.do_listxattr(ch, &header, size),
            Request::Removexattr { name } => self.do_removexattr(ch, &header, name),
            Request::Flush { fh } => self.do_flush(ch, &header, fh),
            Request::Init { major, minor } => self.do_init(ch, &header, major, minor),
            Request::Opendir { flags } => self.do_opendir(ch, &header, flags),
            Request::Readdir { fh, offset, size } => {
                self.do_readdir(ch, &header, fh, offset, size);
            }
            Request::Releasedir { fh, .. } => self.do_releasedir(ch, &header, fh),
            Request::Fsyncdir { fh, datasync } => self.do_fsyncdir(ch, &header, fh, datasync),
            Request::Unsupported(opcode) => {
                warn!(opcode, "unsupported opcode");
                self.send_error(ch, header.unique, Errno::NOSYS);
            }
        }
    }

    // ── Lookup family ───────────────────────────────────────────────────

    /// Stats `path`, binds `(parent, name)` in the node table, and builds
    /// the entry reply. Shared by lookup/mknod/mkdir/symlink/link.
    fn lookup_path(
        &self,
        parent: NodeId,
        unique: u64,
        name: &OsStr,
        path: &Path,
    ) -> OpResult<EntryOut> {
        let getattr = self.ops.getattr.as_ref().ok_or(Errno::NOSYS)?;
        let attr = getattr(path)?;
        let mut wire = Attr::from(&attr);
        let (id, generation) = self.nodes.lock().lookup_or_insert(parent, name, unique);
        if !self.opts.use_ino() {
            wire.ino = id;
        }
        if self.opts.debug() {
            debug!(nodeid = id, "entry bound");
        }
        Ok(entry_out(id, generation, wire))
    }

    fn do_lookup(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), "LOOKUP");
                }
                self.lookup_path(header.nodeid, header.unique, name, &path)
            })
        };
        self.send_entry(ch, header, res);
    }

    fn do_forget(&self, header: &RequestHeader, nlookup: u64, version: ProtoVersion) {
        if self.opts.debug() {
            debug!(nodeid = header.nodeid, nlookup, "FORGET");
        }
        let mut nodes = self.nodes.lock();
        if version.has_forget_counts() {
            nodes.forget(header.nodeid, nlookup);
        } else {
            // Legacy kernels send the last-seen request id, not a count.
            nodes.forget_by_version(header.nodeid, nlookup);
        }
    }

    // ── Attributes ──────────────────────────────────────────────────────

    fn do_getattr(&self, ch: &dyn Channel, header: &RequestHeader) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let getattr = self.ops.getattr.as_ref().ok_or(Errno::NOSYS)?;
                getattr(&path)
            })
        };
        match res {
            Ok(attr) => {
                let mut wire = Attr::from(&attr);
                if !self.opts.use_ino() {
                    wire.ino = header.nodeid;
                }
                let out = attr_out(wire);
                let _ = self.send(ch, header.unique, 0, out.as_bytes());
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_setattr(&self, ch: &dyn Channel, header: &RequestHeader, valid: u32, attr: &Attr) {
        let valid = SetattrValid::from_bits_truncate(valid);
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                // Apply each requested field in order, stopping on the
                // first failure, then re-read the result.
                let getattr = self.ops.getattr.as_ref().ok_or(Errno::NOSYS)?;
                if valid.contains(SetattrValid::MODE) {
                    let chmod = self.ops.chmod.as_ref().ok_or(Errno::NOSYS)?;
                    chmod(&path, attr.mode)?;
                }
                if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
                    let chown = self.ops.chown.as_ref().ok_or(Errno::NOSYS)?;
                    let uid = valid.contains(SetattrValid::UID).then_some(attr.uid);
                    let gid = valid.contains(SetattrValid::GID).then_some(attr.gid);
                    chown(&path, uid, gid)?;
                }
                if valid.contains(SetattrValid::SIZE) {
                    let truncate = self.ops.truncate.as_ref().ok_or(Errno::NOSYS)?;
                    truncate(&path, attr.size)?;
                }
                if valid.contains(SetattrValid::ATIME | SetattrValid::MTIME) {
                    let utime = self.ops.utime.as_ref().ok_or(Errno::NOSYS)?;
                    utime(
                        &path,
                        systime(attr.atime, attr.atimensec),
                        systime(attr.mtime, attr.mtimensec),
                    )?;
                }
                getattr(&path)
            })
        };
        match res {
            Ok(attr) => {
                let mut wire = Attr::from(&attr);
                if !self.opts.use_ino() {
                    wire.ino = header.nodeid;
                }
                let out = attr_out(wire);
                let _ = self.send(ch, header.unique, 0, out.as_bytes());
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_readlink(&self, ch: &dyn Channel, header: &RequestHeader) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let readlink = self.ops.readlink.as_ref().ok_or(Errno::NOSYS)?;
                readlink(&path)
            })
        };
        match res {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                let bytes = target.as_os_str().as_bytes();
                let len = bytes.len().min(MAX_PATH);
                let _ = self.send(ch, header.unique, 0, &bytes[..len]);
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    // ── Creation ────────────────────────────────────────────────────────

    fn do_mknod(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        mode: u32,
        rdev: u32,
        name: &OsStr,
    ) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), "MKNOD");
                }
                let mknod = self.ops.mknod.as_ref().ok_or(Errno::NOSYS)?;
                if self.ops.getattr.is_none() {
                    return Err(Errno::NOSYS);
                }
                mknod(&path, mode, u64::from(rdev))?;
                self.lookup_path(header.nodeid, header.unique, name, &path)
            })
        };
        self.send_entry(ch, header, res);
    }

    fn do_mkdir(&self, ch: &dyn Channel, header: &RequestHeader, mode: u32, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), "MKDIR");
                }
                let mkdir = self.ops.mkdir.as_ref().ok_or(Errno::NOSYS)?;
                if self.ops.getattr.is_none() {
                    return Err(Errno::NOSYS);
                }
                mkdir(&path, mode)?;
                self.lookup_path(header.nodeid, header.unique, name, &path)
            })
        };
        self.send_entry(ch, header, res);
    }

    fn do_symlink(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr, target: &OsStr) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), target = %Path::new(target).display(), "SYMLINK");
                }
                let symlink = self.ops.symlink.as_ref().ok_or(Errno::NOSYS)?;
                if self.ops.getattr.is_none() {
                    return Err(Errno::NOSYS);
                }
                symlink(Path::new(target), &path)?;
                self.lookup_path(header.nodeid, header.unique, name, &path)
            })
        };
        self.send_entry(ch, header, res);
    }

    fn do_link(&self, ch: &dyn Channel, header: &RequestHeader, oldnodeid: u64, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.read();
            let paths = {
                let nodes = self.nodes.lock();
                nodes.path_of(oldnodeid, None).and_then(|oldpath| {
                    nodes
                        .path_of(header.nodeid, Some(name))
                        .map(|newpath| (oldpath, newpath))
                })
            };
            paths.and_then(|(oldpath, newpath)| {
                if self.opts.debug() {
                    debug!(path = %newpath.display(), "LINK");
                }
                let link = self.ops.link.as_ref().ok_or(Errno::NOSYS)?;
                if self.ops.getattr.is_none() {
                    return Err(Errno::NOSYS);
                }
                link(&oldpath, &newpath)?;
                self.lookup_path(header.nodeid, header.unique, name, &newpath)
            })
        };
        self.send_entry(ch, header, res);
    }

    // ── Hidden-rename policy ────────────────────────────────────────────

    /// Synthesizes a shadow name that is free both in the table and on the
    /// backing store (probed through the user's `getattr`).
    fn free_hidden_name(&self, dir: NodeId, oldname: &OsStr) -> Option<(OsString, PathBuf)> {
        let getattr = self.ops.getattr.as_ref()?;
        for _ in 0..HIDDEN_NAME_RETRIES {
            let newname = self.nodes.lock().hidden_name(dir, oldname)?;
            let newpath = self.path_of(dir, Some(&newname)).ok()?;
            if getattr(&newpath).is_err() {
                return Some((newname, newpath));
            }
        }
        None
    }

    /// Moves a busy name out of the way instead of deleting it: the file
    /// keeps existing on the backing store under a shadow name until its
    /// last open handle is released.
    fn hide_node(&self, oldpath: &Path, dir: NodeId, oldname: &OsStr) -> OpResult<()> {
        let (Some(rename), Some(_unlink)) = (self.ops.rename.as_ref(), self.ops.unlink.as_ref())
        else {
            return Err(Errno::BUSY);
        };
        let (newname, newpath) = self.free_hidden_name(dir, oldname).ok_or(Errno::BUSY)?;
        rename(oldpath, &newpath).map_err(|_| Errno::BUSY)?;
        self.nodes.lock().rename(dir, oldname, dir, &newname, true)
    }

    // ── Namespace mutation ──────────────────────────────────────────────

    fn do_unlink(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.write();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), "UNLINK");
                }
                let unlink = self.ops.unlink.as_ref().ok_or(Errno::NOSYS)?;
                let busy = !self.opts.hard_remove()
                    && self.nodes.lock().is_open(header.nodeid, name);
                if busy {
                    self.hide_node(&path, header.nodeid, name)
                } else {
                    unlink(&path)?;
                    self.nodes.lock().remove(header.nodeid, name);
                    Ok(())
                }
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    fn do_rmdir(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.write();
            let path = self.path_of(header.nodeid, Some(name));
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(path = %path.display(), "RMDIR");
                }
                let rmdir = self.ops.rmdir.as_ref().ok_or(Errno::NOSYS)?;
                rmdir(&path)?;
                self.nodes.lock().remove(header.nodeid, name);
                Ok(())
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    fn do_rename(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        newdir: u64,
        name: &OsStr,
        newname: &OsStr,
    ) {
        let olddir = header.nodeid;
        let res = {
            let _tree = self.tree_lock.write();
            let paths = {
                let nodes = self.nodes.lock();
                nodes.path_of(olddir, Some(name)).and_then(|oldpath| {
                    nodes
                        .path_of(newdir, Some(newname))
                        .map(|newpath| (oldpath, newpath))
                })
            };
            paths.and_then(|(oldpath, newpath)| {
                if self.opts.debug() {
                    debug!(from = %oldpath.display(), to = %newpath.display(), "RENAME");
                }
                let rename = self.ops.rename.as_ref().ok_or(Errno::NOSYS)?;
                let target_busy = !self.opts.hard_remove()
                    && self.nodes.lock().is_open(newdir, newname);
                if target_busy {
                    // The displaced file is still open: move it aside.
                    self.hide_node(&newpath, newdir, newname)?;
                }
                rename(&oldpath, &newpath)?;
                self.nodes
                    .lock()
                    .rename(olddir, name, newdir, newname, false)
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    // ── Open files ──────────────────────────────────────────────────────

    fn do_open(&self, ch: &dyn Channel, header: &RequestHeader, flags: u32) {
        let _tree = self.tree_lock.read();
        let mut fi = FileInfo {
            flags: flags as i32,
            fh: 0,
            writepage: false,
        };
        let path = self.path_of(header.nodeid, None);
        let res = path.and_then(|path| {
            let open = self.ops.open.as_ref().ok_or(Errno::NOSYS)?;
            open(&path, &mut fi)?;
            Ok(path)
        });

        match res {
            Ok(path) => {
                if self.opts.debug() {
                    debug!(fh = fi.fh, flags, "OPEN");
                }
                let out = OpenOut {
                    fh: fi.fh,
                    open_flags: 0,
                    padding: 0,
                };
                let body_len = reply::open_out_len(self.version());

                // The node lock stays held across the reply so a racing
                // release of this very open cannot observe a zero count.
                let mut nodes = self.nodes.lock();
                match self.send(ch, header.unique, 0, &out.as_bytes()[..body_len]) {
                    Err(err) if err == Errno::NOENT => {
                        drop(nodes);
                        // The open syscall was interrupted; the handle we
                        // just created must be balanced out.
                        if let Some(release) = self.ops.release.as_ref() {
                            let _ = release(&path, &fi);
                        }
                    }
                    _ => nodes.inc_open(header.nodeid),
                }
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_read(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64, offset: u64, size: u32) {
        let fi = FileInfo {
            flags: 0,
            fh,
            writepage: false,
        };
        let mut buf = vec![0u8; size as usize];
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(fh, size, offset, "READ");
                }
                let read = self.ops.read.as_ref().ok_or(Errno::NOSYS)?;
                read(&path, &mut buf, offset, &fi)
            })
        };
        match res {
            Ok(count) => {
                let count = count.min(buf.len());
                if self.opts.debug() {
                    debug!(fh, count, "read done");
                }
                let _ = self.send(ch, header.unique, 0, &buf[..count]);
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_write(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        fh: u64,
        offset: u64,
        data: &[u8],
        writepage: bool,
    ) {
        let fi = FileInfo {
            flags: 0,
            fh,
            writepage,
        };
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(fh, size = data.len(), offset, writepage, "WRITE");
                }
                let write = self.ops.write.as_ref().ok_or(Errno::NOSYS)?;
                write(&path, data, offset, &fi)
            })
        };
        match res {
            Ok(count) => {
                let out = WriteOut {
                    size: count as u32,
                    padding: 0,
                };
                let body_len = reply::write_out_len(self.version());
                let _ = self.send(ch, header.unique, 0, &out.as_bytes()[..body_len]);
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_statfs(&self, ch: &dyn Channel, header: &RequestHeader) {
        let res = match self.ops.statfs.as_ref() {
            Some(statfs) => statfs(Path::new("/")),
            // Usable defaults when the filesystem does not care.
            None => Ok(Statfs {
                block_size: 512,
                name_max: 255,
                ..Statfs::default()
            }),
        };
        match res {
            Ok(st) => {
                let out = StatfsOut::from(&st);
                let _ = self.send(ch, header.unique, 0, out.as_bytes());
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_flush(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64) {
        let fi = FileInfo {
            flags: 0,
            fh,
            writepage: false,
        };
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(fh, "FLUSH");
                }
                let flush = self.ops.flush.as_ref().ok_or(Errno::NOSYS)?;
                flush(&path, &fi)
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    fn do_release(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64, flags: u32) {
        let fi = FileInfo {
            flags: flags as i32,
            fh,
            writepage: false,
        };
        let unlink_hidden = self.nodes.lock().dec_open(header.nodeid);

        {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None).ok();
            if self.opts.debug() {
                debug!(fh, flags, "RELEASE");
            }
            if let Some(release) = self.ops.release.as_ref() {
                let _ = release(path.as_deref().unwrap_or_else(|| Path::new("-")), &fi);
            }
            if unlink_hidden
                && let Some(path) = path.as_deref()
                && let Some(unlink) = self.ops.unlink.as_ref()
            {
                // Last handle of a hidden file: now it really goes away.
                let _ = unlink(path);
            }
        }

        let _ = self.send(ch, header.unique, 0, &[]);
    }

    fn do_fsync(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64, datasync: bool) {
        let fi = FileInfo {
            flags: 0,
            fh,
            writepage: false,
        };
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                if self.opts.debug() {
                    debug!(fh, "FSYNC");
                }
                let fsync = self.ops.fsync.as_ref().ok_or(Errno::NOSYS)?;
                fsync(&path, datasync, &fi)
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    // ── Extended attributes ─────────────────────────────────────────────

    fn do_setxattr(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let setxattr = self.ops.setxattr.as_ref().ok_or(Errno::NOSYS)?;
                setxattr(&path, name, value, flags)
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    fn do_getxattr(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr, size: u32) {
        let mut buf = vec![0u8; size as usize];
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let getxattr = self.ops.getxattr.as_ref().ok_or(Errno::NOSYS)?;
                getxattr(&path, name, &mut buf)
            })
        };
        self.send_xattr_result(ch, header, size, &buf, res);
    }

    fn do_listxattr(&self, ch: &dyn Channel, header: &RequestHeader, size: u32) {
        let mut buf = vec![0u8; size as usize];
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let listxattr = self.ops.listxattr.as_ref().ok_or(Errno::NOSYS)?;
                listxattr(&path, &mut buf)
            })
        };
        self.send_xattr_result(ch, header, size, &buf, res);
    }

    /// A zero-size request is a probe for the attribute length; otherwise
    /// the filled bytes are the reply body.
    fn send_xattr_result(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        size: u32,
        buf: &[u8],
        res: OpResult<usize>,
    ) {
        match res {
            Ok(count) if size == 0 => {
                let out = GetxattrOut {
                    size: count as u32,
                    padding: 0,
                };
                let body_len = reply::getxattr_out_len(self.version());
                let _ = self.send(ch, header.unique, 0, &out.as_bytes()[..body_len]);
            }
            Ok(count) => {
                let count = count.min(buf.len());
                let _ = self.send(ch, header.unique, 0, &buf[..count]);
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn do_removexattr(&self, ch: &dyn Channel, header: &RequestHeader, name: &OsStr) {
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let removexattr = self.ops.removexattr.as_ref().ok_or(Errno::NOSYS)?;
                removexattr(&path, name)
            })
        };
        self.send_empty(ch, header.unique, res);
    }

    // ── Handshake ───────────────────────────────────────────────────────

    fn do_init(&self, ch: &dyn Channel, header: &RequestHeader, major: u32, minor: u32) {
        if self.opts.debug() {
            debug!(major, minor, "INIT");
        }
        let negotiated = match major {
            5 => ProtoVersion { major: 5, minor: 1 },
            6 => ProtoVersion { major: 6, minor: 1 },
            _ => ProtoVersion::default(),
        };
        {
            let mut proto = self.proto.lock();
            proto.initialized = true;
            proto.version = negotiated;
        }
        if let Some(init) = self.ops.init.as_ref() {
            init();
        }
        let out = InitInOut {
            major: negotiated.major,
            minor: negotiated.minor,
        };
        if self.opts.debug() {
            debug!(
                major = negotiated.major,
                minor = negotiated.minor,
                "INIT reply"
            );
        }
        let _ = self.send(ch, header.unique, 0, out.as_bytes());
    }

    // ── Directories ─────────────────────────────────────────────────────

    fn register_dir(&self, node: Option<NodeId>, fi: FileInfo) -> u64 {
        let fh = self.next_dir_fh.fetch_add(1, Ordering::Relaxed);
        self.dirs
            .lock()
            .insert(fh, Arc::new(DirHandle::new(node, fi)));
        fh
    }

    fn do_opendir(&self, ch: &dyn Channel, header: &RequestHeader, flags: u32) {
        let node = self.opts.readdir_ino().then_some(header.nodeid);
        let mut fi = FileInfo {
            flags: flags as i32,
            fh: 0,
            writepage: false,
        };
        let body_len = reply::open_out_len(self.version());

        let Some(opendir) = self.ops.opendir.as_ref() else {
            // No user hook: the handle is pure dispatcher state.
            let fh = self.register_dir(node, fi);
            let out = OpenOut {
                fh,
                ..OpenOut::default()
            };
            if self
                .send(ch, header.unique, 0, &out.as_bytes()[..body_len])
                .is_err()
            {
                self.dirs.lock().remove(&fh);
            }
            return;
        };

        let _tree = self.tree_lock.read();
        let path = self.path_of(header.nodeid, None);
        let res = path.and_then(|path| {
            opendir(&path, &mut fi)?;
            Ok(path)
        });
        match res {
            Ok(path) => {
                let fh = self.register_dir(node, fi);
                let out = OpenOut {
                    fh,
                    ..OpenOut::default()
                };
                if let Err(err) = self.send(ch, header.unique, 0, &out.as_bytes()[..body_len])
                    && err == Errno::NOENT
                {
                    // Interrupted opendir: balance the user handle and
                    // drop ours.
                    if let Some(releasedir) = self.ops.releasedir.as_ref() {
                        let _ = releasedir(&path, &fi);
                    }
                    self.dirs.lock().remove(&fh);
                }
            }
            Err(errno) => self.send_error(ch, header.unique, errno),
        }
    }

    fn dir_handle(&self, fh: u64) -> Option<Arc<DirHandle>> {
        self.dirs.lock().get(&fh).cloned()
    }

    /// Runs the user's `readdir` into the handle's buffer. Called with the
    /// handle lock held.
    fn readdir_fill(
        &self,
        header: &RequestHeader,
        dh: &DirHandle,
        buf: &mut DirBuffer,
        offset: u64,
        size: u32,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.path_of(header.nodeid, None)?;
        let compat5 = self.version().is_compat5();

        buf.reset(size as usize);
        let res = match self.ops.readdir.as_ref() {
            Some(readdir) => {
                let mut filler = DirFiller::new(
                    buf,
                    &self.nodes,
                    dh.node,
                    self.opts.use_ino(),
                    self.opts.readdir_ino(),
                    compat5,
                );
                // The legacy major cannot express offsets: always refill
                // from the start and buffer everything.
                let offset = if compat5 { 0 } else { offset };
                readdir(&path, &mut filler, offset, &dh.fi)
            }
            None => Err(Errno::NOSYS),
        };
        let res = res.and_then(|()| buf.take_error().map_or(Ok(()), Err));
        if res.is_err() {
            buf.invalidate();
        }
        res
    }

    fn do_readdir(
        &self,
        ch: &dyn Channel,
        header: &RequestHeader,
        fh: u64,
        offset: u64,
        size: u32,
    ) {
        let Some(dh) = self.dir_handle(fh) else {
            self.send_error(ch, header.unique, Errno::BADF);
            return;
        };
        let mut buf = dh.buf.lock();
        if self.opts.debug() {
            debug!(fh, offset, size, "READDIR");
        }
        if !buf.is_filled()
            && let Err(errno) = self.readdir_fill(header, &dh, &mut buf, offset, size)
        {
            self.send_error(ch, header.unique, errno);
            return;
        }
        let window = buf.window(offset, size);
        let _ = self.send(ch, header.unique, 0, window);
    }

    fn do_releasedir(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64) {
        let Some(dh) = self.dirs.lock().remove(&fh) else {
            self.send_error(ch, header.unique, Errno::BADF);
            return;
        };
        if let Some(releasedir) = self.ops.releasedir.as_ref() {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None).ok();
            let _ = releasedir(path.as_deref().unwrap_or_else(|| Path::new("-")), &dh.fi);
        }
        // Drain a racing fill before the buffer goes away.
        drop(dh.buf.lock());
        let _ = self.send(ch, header.unique, 0, &[]);
    }

    fn do_fsyncdir(&self, ch: &dyn Channel, header: &RequestHeader, fh: u64, datasync: bool) {
        let Some(dh) = self.dir_handle(fh) else {
            self.send_error(ch, header.unique, Errno::BADF);
            return;
        };
        let res = {
            let _tree = self.tree_lock.read();
            let path = self.path_of(header.nodeid, None);
            path.and_then(|path| {
                let fsyncdir = self.ops.fsyncdir.as_ref().ok_or(Errno::NOSYS)?;
                fsyncdir(&path, datasync, &dh.fi)
            })
        };
        self.send_empty(ch, header.unique, res);
    }
}

impl Drop for Dispatcher {
    /// Session teardown: shadow files that never saw their last release
    /// are unlinked for real, then the user's `destroy` hook runs.
    fn drop(&mut self) {
        let nodes = self.nodes.get_mut();
        if let Some(unlink) = self.ops.unlink.as_ref() {
            for id in nodes.hidden_nodes() {
                if let Ok(path) = nodes.path_of(id, None) {
                    let _ = unlink(&path);
                }
            }
        }
        if let Some(destroy) = self.ops.destroy.as_ref() {
            destroy();
        }
    }
}
