//! Wire protocol: raw layouts, request decoding, reply encoding.

pub mod abi;
pub mod decode;
pub mod reply;

pub use abi::{KERNEL_MINOR_VERSION, KERNEL_VERSION, MAX_REQUEST_SIZE, Opcode, ROOT_ID};
pub use decode::{DecodeError, Request, RequestHeader, decode_body, decode_header};

/// Negotiated protocol version, fixed by the `INIT` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtoVersion {
    /// True when the legacy off-less directory layout and shrunken struct
    /// layouts apply.
    #[must_use]
    pub fn is_compat5(self) -> bool {
        self.major == 5
    }

    /// True when explicit forget counts are authoritative; below this the
    /// version-matching forget path applies.
    #[must_use]
    pub fn has_forget_counts(self) -> bool {
        self.major > 6
    }
}

impl Default for ProtoVersion {
    fn default() -> Self {
        Self {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
        }
    }
}

/// Handshake state consulted on every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoState {
    pub version: ProtoVersion,
    pub initialized: bool,
}
