//! Error taxonomy for the emulator core
//!
//! Configuration and media faults become structured failures at the API
//! boundary. Internal inconsistencies halt the emulator instead and surface
//! through the message queue as `Msg::CpuHalt`.

use thiserror::Error;

/// Faults reported across the public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    //
    // Configuration faults
    //
    /// An option was given a value outside its legal range
    #[error("invalid argument for option{}", fmt_detail(.0))]
    InvalidOptionValue(Option<String>),

    /// The option can only be changed while the core is powered off
    #[error("option is locked while the emulator is powered on")]
    OptionLocked,

    /// The option is not supported by this component
    #[error("unsupported option")]
    UnsupportedOption,

    //
    // Media faults
    //
    /// No boot ROM is installed
    #[error("no ROM installed")]
    RomMissing,

    /// Chip RAM is required but not configured
    #[error("no chip RAM installed")]
    ChipRamMissing,

    /// The ROM image exceeds the supported size
    #[error("ROM image is too large")]
    RomTooLarge,

    /// An encrypted ROM could not be decrypted
    #[error("ROM decryption failed{}", fmt_detail(.0))]
    DecryptionFailed(Option<String>),

    /// A file of the wrong type was supplied
    #[error("file type mismatch")]
    FileTypeMismatch,

    /// The disk does not fit the drive (diameter or density)
    #[error("disk is incompatible with this drive")]
    DiskIncompatible,

    //
    // Snapshot faults
    //
    /// The snapshot payload failed a size or structure check
    #[error("snapshot is corrupted")]
    SnapshotCorrupted,

    /// The snapshot was taken by a different core version
    #[error("snapshot version mismatch (expected {expected}, found {found})")]
    SnapshotVersion { expected: String, found: String },

    //
    // Remote-observer faults
    //
    /// start() was called on a running server
    #[error("server is already running")]
    ServerRunning,

    /// stop() or disconnect() was called on a stopped server
    #[error("server is not running")]
    ServerNotRunning,

    /// The peer closed the connection
    #[error("remote connection closed")]
    ServerDisconnected,

    /// A low-level socket operation failed
    #[error("socket error: {0}")]
    SocketError(String),

    /// A debug-stub packet carried a bad checksum
    #[error("invalid packet checksum")]
    InvalidChecksum,

    /// A debug-stub packet was malformed
    #[error("invalid packet format")]
    InvalidFormat,

    /// The command is not part of the protocol
    #[error("unrecognized command{}", fmt_detail(.0))]
    UnknownCommand(Option<String>),

    /// The command is valid but not implemented by this stub
    #[error("unsupported command{}", fmt_detail(.0))]
    UnsupportedCommand(Option<String>),

    //
    // Unspecified behavior
    //
    /// A code path whose behavior is deliberately left unspecified
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(s) => format!(": {}", s),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = CoreError::InvalidOptionValue(Some("-1, 1, 2, 4, 8".into()));
        assert_eq!(err.to_string(), "invalid argument for option: -1, 1, 2, 4, 8");

        let err = CoreError::UnknownCommand(None);
        assert_eq!(err.to_string(), "unrecognized command");

        let err = CoreError::SnapshotVersion {
            expected: "0.1.0".into(),
            found: "0.0.9".into(),
        };
        assert!(err.to_string().contains("0.0.9"));
    }
}
