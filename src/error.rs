//! Error types for mftscan
//!
//! Open-time failures are fatal and abort the scan; record-level
//! anomalies are local and merely counted so a scan of a volume with a
//! few damaged records still yields a usable tree.

use thiserror::Error;

/// Main error type for mftscan operations
#[derive(Error, Debug)]
pub enum MftScanError {
    #[error("Access denied opening volume '{0}'")]
    AccessDenied(String),

    #[error("Volume '{0}' is not an NTFS filesystem")]
    NotNtfs(String),

    #[error("Volume '{0}' is busy or locked by another process")]
    DeviceBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to locate the MFT: {0}")]
    MftLocation(String),

    #[error("Corrupt MFT record at index {0}: {1}")]
    CorruptRecord(u64, String),

    #[error("Malformed run list: {0}")]
    MalformedRunList(String),

    #[error("Unreadable record at index {0}: {1}")]
    UnreadableRecord(u64, std::io::Error),

    #[error("Unaligned volume read: offset {offset} / length {length} not a multiple of sector size {sector_size}")]
    UnalignedRead {
        offset: u64,
        length: usize,
        sector_size: u32,
    },

    #[error("Scan cancelled")]
    Cancelled,

    #[error("A scan is already in progress")]
    ScanInProgress,
}

/// Result type alias for mftscan operations
pub type Result<T> = std::result::Result<T, MftScanError>;

impl MftScanError {
    /// Fatal errors abort the whole scan and surface through the
    /// `Failed` terminal state. Everything else degrades to a
    /// skipped record or attribute.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MftScanError::AccessDenied(_)
                | MftScanError::NotNtfs(_)
                | MftScanError::DeviceBusy(_)
                | MftScanError::Io(_)
                | MftScanError::MftLocation(_)
                | MftScanError::UnalignedRead { .. }
        )
    }

    /// Recoverable errors skip the one record/attribute and continue.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal() && !matches!(self, MftScanError::Cancelled)
    }
}
