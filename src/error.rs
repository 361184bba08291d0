//! Errno-style error values as they travel between user callbacks and the
//! kernel reply header.

use std::fmt;
use std::io;

/// A positive errno value returned by a user callback or synthesized by the
/// dispatch core. The reply header carries its negation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const PERM: Self = Self(libc::EPERM);
    pub const NOENT: Self = Self(libc::ENOENT);
    pub const INTR: Self = Self(libc::EINTR);
    pub const IO: Self = Self(libc::EIO);
    pub const BADF: Self = Self(libc::EBADF);
    pub const NOMEM: Self = Self(libc::ENOMEM);
    pub const ACCES: Self = Self(libc::EACCES);
    pub const BUSY: Self = Self(libc::EBUSY);
    pub const NODEV: Self = Self(libc::ENODEV);
    pub const INVAL: Self = Self(libc::EINVAL);
    pub const RANGE: Self = Self(libc::ERANGE);
    pub const NOSYS: Self = Self(libc::ENOSYS);
    pub const PROTO: Self = Self(libc::EPROTO);
    pub const NAMETOOLONG: Self = Self(libc::ENAMETOOLONG);

    /// Wraps a raw errno value. Negative input is normalized to positive so
    /// callbacks may return either convention.
    #[must_use]
    pub fn new(raw: i32) -> Self {
        Self(raw.abs())
    }

    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }

    /// The value to place in the reply header: the negated errno, with
    /// out-of-range values replaced by `-ERANGE` (a callback bug must not
    /// turn into a nonsense kernel status).
    #[must_use]
    pub fn to_wire(self) -> i32 {
        if self.0 < 1 || self.0 >= 1000 {
            tracing::error!(errno = self.0, "bad error value from callback");
            return -libc::ERANGE;
        }
        -self.0
    }

    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl std::error::Error for Errno {}

/// Shorthand for callback and handler results.
pub type OpResult<T> = Result<T, Errno>;
