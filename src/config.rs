//! Mount-time library options, parsed from a comma-separated option string.

use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;
use tracing::warn;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct MountFlags: u32 {
        /// Verbose tracing of every request and reply.
        const DEBUG        = 1 << 1;
        /// If a file is removed while still open, remove it immediately
        /// instead of hiding it behind a shadow name.
        const HARD_REMOVE  = 1 << 2;
        /// Trust inode numbers from the user's `getattr`/`readdir` instead
        /// of overriding them with the synthesized node id.
        const USE_INO      = 1 << 3;
        /// Only allow root or the filesystem owner to access the mount.
        const ALLOW_ROOT   = 1 << 4;
        /// Best-effort fill of inode numbers in readdir from the node table.
        const READDIR_INO  = 1 << 5;
    }
}

/// Library options accepted at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOptions {
    flags: MountFlags,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionParseError {
    #[error("empty option in option string")]
    EmptyOption,
}

impl MountOptions {
    /// Returns true if `opt` is an option this library consumes, as opposed
    /// to one that belongs to the mount helper.
    #[must_use]
    pub fn is_lib_option(opt: &str) -> bool {
        matches!(
            opt,
            "debug" | "hard_remove" | "use_ino" | "allow_root" | "readdir_ino"
        )
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.flags.contains(MountFlags::DEBUG)
    }

    #[must_use]
    pub fn hard_remove(&self) -> bool {
        self.flags.contains(MountFlags::HARD_REMOVE)
    }

    #[must_use]
    pub fn use_ino(&self) -> bool {
        self.flags.contains(MountFlags::USE_INO)
    }

    #[must_use]
    pub fn allow_root(&self) -> bool {
        self.flags.contains(MountFlags::ALLOW_ROOT)
    }

    #[must_use]
    pub fn readdir_ino(&self) -> bool {
        self.flags.contains(MountFlags::READDIR_INO)
    }
}

impl FromStr for MountOptions {
    type Err = OptionParseError;

    /// Parses `"debug,hard_remove,..."`. Unknown options are warned about
    /// and skipped, so option strings shared with a mount helper pass
    /// through unchanged.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = MountFlags::empty();
        if s.is_empty() {
            return Ok(Self { flags });
        }
        for opt in s.split(',') {
            match opt {
                "" => return Err(OptionParseError::EmptyOption),
                "debug" => flags |= MountFlags::DEBUG,
                "hard_remove" => flags |= MountFlags::HARD_REMOVE,
                "use_ino" => flags |= MountFlags::USE_INO,
                "allow_root" => flags |= MountFlags::ALLOW_ROOT,
                "readdir_ino" => flags |= MountFlags::READDIR_INO,
                other => warn!(option = other, "unknown option"),
            }
        }
        Ok(Self { flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_parses_to_defaults() {
        let opts: MountOptions = "".parse().unwrap();
        assert_eq!(opts, MountOptions::default());
        assert!(!opts.debug());
    }

    #[test]
    fn known_options_set_their_flags() {
        let opts: MountOptions = "debug,hard_remove,use_ino,allow_root,readdir_ino"
            .parse()
            .unwrap();
        assert!(opts.debug());
        assert!(opts.hard_remove());
        assert!(opts.use_ino());
        assert!(opts.allow_root());
        assert!(opts.readdir_ino());
    }

    #[test]
    fn unknown_options_are_skipped() {
        let opts: MountOptions = "debug,max_read=4096".parse().unwrap();
        assert!(opts.debug());
        assert!(!opts.use_ino());
    }

    #[test]
    fn dangling_comma_is_rejected() {
        let err = "debug,".parse::<MountOptions>().unwrap_err();
        assert_eq!(err, OptionParseError::EmptyOption);
    }

    #[test]
    fn lib_option_classification() {
        assert!(MountOptions::is_lib_option("hard_remove"));
        assert!(!MountOptions::is_lib_option("allow_other"));
    }
}
