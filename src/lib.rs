//! mftscan - Direct-MFT NTFS volume scanner
//!
//! Enumerates every file and directory on an NTFS volume by reading the
//! Master File Table straight off the raw block device, bypassing
//! directory traversal entirely. A single sequential pass over the MFT
//! yields names, sizes, timestamps, attribute flags and the physical
//! fragment layout of every data stream, assembled into a rooted tree
//! with per-directory size roll-ups.
//!
//! # Example
//!
//! ```no_run
//! use mftscan::{format_size, ScanController, ScanOptions, ScanState};
//!
//! fn main() -> mftscan::Result<()> {
//!     let mut controller = ScanController::new(ScanOptions::default());
//!     controller.start(r"\\.\C:")?;
//!
//!     for event in controller.events() {
//!         println!("{:?} / {:?}", event.state, event.progress);
//!         if event.state.is_terminal() {
//!             break;
//!         }
//!     }
//!
//!     if let Some(tree) = controller.tree() {
//!         println!("Files: {}", tree.stats.total_files);
//!         println!("Total size: {}", format_size(tree.stats.total_size));
//!         for (fragments, files) in mftscan::analysis::group_by_fragment_count(&tree, 16) {
//!             println!("{} fragments: {} files", fragments, files.len());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod controller;
pub mod error;
pub mod ntfs;
pub mod tree;
pub mod volume;

// Re-export main types
pub use controller::{ProgressState, ScanController, ScanEvent, ScanOptions, ScanState};
pub use error::{MftScanError, Result};
pub use tree::{
    FileReference, Fragment, Node, NodeId, ScanStats, Stream, Tree, TreeBuilder,
};
pub use volume::{VolumeAccessor, VolumeGeometry};

// Re-export NTFS internals that callers inspecting raw records might need
pub use ntfs::{decode_runs, encode_runs, MftReader, RecordParser};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let exp = (bytes as f64).log(1024.0).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let size = bytes as f64 / 1024_f64.powi(exp as i32);

    if exp == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[exp])
    }
}

/// Format a Windows FILETIME as a human-readable date string
pub fn format_filetime(filetime: u64) -> String {
    use ntfs::structs::filetime_to_datetime;
    filetime_to_datetime(filetime)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
