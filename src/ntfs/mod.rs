//! NTFS on-disk format support
//!
//! Everything needed to read a volume's Master File Table directly:
//! record and attribute layouts, run-list decoding, per-record parsing
//! with fix-up verification, and the streaming reader that treats the
//! MFT itself as the (possibly fragmented) file it is.

pub mod reader;
pub mod record;
pub mod runlist;
pub mod structs;

pub use reader::MftReader;
pub use record::{ParsedRecord, RecordParser};
pub use runlist::{decode_runs, encode_runs};
pub use structs::{
    AttributeType, FileNameAttribute, FilenameNamespace, MftRecordHeader, StandardInformation,
};
