//! The device channel and the single-reader request loop.
//!
//! How the descriptor is obtained and mounted is someone else's business;
//! this module only contracts the transport: one `receive` returns one
//! framed request, one `send` writes one framed reply atomically.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use tracing::error;

use crate::config::MountOptions;
use crate::dispatch::Dispatcher;
use crate::ops::Operations;
use crate::proto::MAX_REQUEST_SIZE;

/// Transport between the kernel device and the dispatcher.
pub trait Channel: Send + Sync {
    /// Reads one framed request into `buf`, blocking until one arrives.
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one reply with a single vectored write; the kernel treats
    /// the write as atomic.
    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()>;
}

/// A channel over the raw device descriptor.
pub struct FdChannel {
    fd: OwnedFd,
}

impl FdChannel {
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl Channel for FdChannel {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.fd.as_raw_fd(), buf).map_err(io::Error::from)
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        nix::sys::uio::writev(&self.fd, bufs)
            .map(|_| ())
            .map_err(io::Error::from)
    }
}

/// One mounted filesystem: a channel plus the dispatcher driving it.
pub struct Session<C: Channel> {
    channel: C,
    fuse: Arc<Dispatcher>,
}

impl<C: Channel> Session<C> {
    #[must_use]
    pub fn new(channel: C, ops: Operations, opts: MountOptions) -> Self {
        Self {
            channel,
            fuse: Arc::new(Dispatcher::new(ops, opts)),
        }
    }

    /// The dispatcher, shareable with worker threads that want to process
    /// requests in parallel.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.fuse
    }

    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Requests loop termination.
    pub fn exit(&self) {
        self.fuse.exit();
    }

    /// Reads and dispatches requests until told to exit.
    ///
    /// Interrupted or raced reads (`EINTR`, `ENOENT`) retry; `ENODEV`
    /// means the filesystem was unmounted and ends the loop silently; any
    /// other read error is logged and ends the loop. Forget requests never
    /// queue behind anything here: the dispatcher processes them inline
    /// without a reply.
    pub fn run(&self) {
        let mut buf = vec![0u8; MAX_REQUEST_SIZE];
        while !self.fuse.exited() {
            let len = match self.channel.receive(&mut buf) {
                Ok(len) => len,
                Err(err) => {
                    if self.fuse.exited() {
                        break;
                    }
                    match err.raw_os_error() {
                        Some(libc::EINTR) | Some(libc::ENOENT) => continue,
                        // Unmounted under us.
                        Some(libc::ENODEV) => {
                            self.fuse.exit();
                            continue;
                        }
                        _ => {
                            error!(%err, "reading device");
                            self.fuse.exit();
                            continue;
                        }
                    }
                }
            };
            if len < self.fuse.min_request_len() {
                // Cannot happen on a healthy device.
                error!(len, "short read on device");
                self.fuse.exit();
                continue;
            }
            self.fuse.dispatch(&self.channel, &buf[..len]);
        }
    }
}
