//! Pathname-level dispatch core for filesystem-in-userspace daemons.
//!
//! The kernel addresses filesystem objects by numeric node id; filesystems
//! are far more pleasant to write against pathnames. This crate sits in
//! between: it reads framed requests from a device channel, resolves node
//! ids back to absolute paths through an in-memory reverse-mapped tree,
//! invokes a user-supplied table of pathname callbacks, and writes framed
//! replies. Along the way it owns the id ↔ (parent, name) lifecycle
//! (lookup, rename, unlink, forget), the "hide a busy unlink behind a
//! shadow name" policy, directory-read buffering, protocol version
//! negotiation, and per-request identity context.
//!
//! ```no_run
//! use std::os::fd::OwnedFd;
//! use pathfuse::{FdChannel, FileAttr, MountOptions, Operations, Session};
//!
//! fn mount(fd: OwnedFd) {
//!     let ops = Operations {
//!         getattr: Some(Box::new(|path| {
//!             if path == std::path::Path::new("/") {
//!                 Ok(FileAttr { mode: libc::S_IFDIR | 0o755, ..FileAttr::default() })
//!             } else {
//!                 Err(pathfuse::Errno::NOENT)
//!             }
//!         })),
//!         ..Operations::default()
//!     };
//!     let opts: MountOptions = "debug".parse().unwrap();
//!     Session::new(FdChannel::new(fd), ops, opts).run();
//! }
//! ```

pub mod config;
pub mod dir;
pub mod dispatch;
pub mod error;
pub mod ops;
pub mod proto;
pub mod session;
pub mod tree;

pub use config::{MountOptions, OptionParseError};
pub use dir::DirFiller;
pub use dispatch::Dispatcher;
pub use error::{Errno, OpResult};
pub use ops::{
    FileAttr, FileInfo, Operations, RequestContext, Statfs, current_context,
};
pub use proto::ROOT_ID;
pub use session::{Channel, FdChannel, Session};
pub use tree::{NodeId, NodeTable};
