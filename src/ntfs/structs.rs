//! NTFS on-disk structures and constants
//!
//! Byte layouts here are NTFS's own, fixed by the OS: the MFT record
//! header, attribute headers, $STANDARD_INFORMATION, $FILE_NAME and
//! $ATTRIBUTE_LIST payloads. All integers are little-endian.

use crate::tree::FileReference;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// MFT record signature "FILE" in little-endian
pub const MFT_RECORD_SIGNATURE: u32 = 0x454C4946;

/// Signature NTFS writes over records it knows are bad ("BAAD")
pub const MFT_RECORD_BAD_SIGNATURE: u32 = 0x44414142;

/// End of attributes marker
pub const ATTRIBUTE_END_MARKER: u32 = 0xFFFFFFFF;

// MFT record flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// ============================================================================
// Attribute Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    End = 0xFFFFFFFF,
}

impl AttributeType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x10 => Some(Self::StandardInformation),
            0x20 => Some(Self::AttributeList),
            0x30 => Some(Self::FileName),
            0x40 => Some(Self::ObjectId),
            0x50 => Some(Self::SecurityDescriptor),
            0x60 => Some(Self::VolumeName),
            0x70 => Some(Self::VolumeInformation),
            0x80 => Some(Self::Data),
            0x90 => Some(Self::IndexRoot),
            0xA0 => Some(Self::IndexAllocation),
            0xB0 => Some(Self::Bitmap),
            0xC0 => Some(Self::ReparsePoint),
            0xFFFFFFFF => Some(Self::End),
            _ => None,
        }
    }
}

// ============================================================================
// Filename Namespace
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilenameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FilenameNamespace {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }

    /// Does `self` displace `other` as the node's display name?
    /// Preference order: Win32 > Win32+DOS > POSIX > DOS, so 8.3 short
    /// aliases never win when a long name exists.
    pub fn beats(self, other: FilenameNamespace) -> bool {
        fn rank(ns: FilenameNamespace) -> u8 {
            match ns {
                FilenameNamespace::Win32 => 3,
                FilenameNamespace::Win32AndDos => 2,
                FilenameNamespace::Posix => 1,
                FilenameNamespace::Dos => 0,
            }
        }
        rank(self) > rank(other)
    }
}

// ============================================================================
// MFT Record Header
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MftRecordHeader {
    pub signature: u32,
    pub update_sequence_offset: u16,
    pub update_sequence_size: u16,
    pub log_sequence_number: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub first_attribute_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_record_reference: u64,
    pub next_attribute_id: u16,
}

impl MftRecordHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            signature: cursor.read_u32::<LittleEndian>().ok()?,
            update_sequence_offset: cursor.read_u16::<LittleEndian>().ok()?,
            update_sequence_size: cursor.read_u16::<LittleEndian>().ok()?,
            log_sequence_number: cursor.read_u64::<LittleEndian>().ok()?,
            sequence_number: cursor.read_u16::<LittleEndian>().ok()?,
            hard_link_count: cursor.read_u16::<LittleEndian>().ok()?,
            first_attribute_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            used_size: cursor.read_u32::<LittleEndian>().ok()?,
            allocated_size: cursor.read_u32::<LittleEndian>().ok()?,
            base_record_reference: cursor.read_u64::<LittleEndian>().ok()?,
            next_attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.signature == MFT_RECORD_SIGNATURE
    }

    pub fn is_in_use(&self) -> bool {
        (self.flags & MFT_RECORD_IN_USE) != 0
    }

    pub fn is_directory(&self) -> bool {
        (self.flags & MFT_RECORD_IS_DIRECTORY) != 0
    }

    /// A base record owns its file; extension records point back at one.
    pub fn is_base_record(&self) -> bool {
        self.base_record_reference == 0
    }

    pub fn base_reference(&self) -> FileReference {
        FileReference::from_raw(self.base_record_reference)
    }
}

// ============================================================================
// Attribute Headers
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AttributeHeader {
    pub attribute_type: u32,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub attribute_id: u16,
}

impl AttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            attribute_type: cursor.read_u32::<LittleEndian>().ok()?,
            length: cursor.read_u32::<LittleEndian>().ok()?,
            non_resident: cursor.read_u8().ok()? != 0,
            name_length: cursor.read_u8().ok()?,
            name_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    /// Attribute name (for named $DATA streams), UTF-16LE on disk.
    pub fn name(&self, attr_data: &[u8]) -> Option<String> {
        if self.name_length == 0 {
            return None;
        }
        let start = self.name_offset as usize;
        let len = self.name_length as usize * 2;
        if start + len > attr_data.len() {
            return None;
        }
        Some(utf16le_to_string(&attr_data[start..start + len]))
    }
}

#[derive(Debug, Clone)]
pub struct ResidentAttributeHeader {
    pub base: AttributeHeader,
    pub value_length: u32,
    pub value_offset: u16,
}

impl ResidentAttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if base.non_resident || data.len() < 24 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        Some(Self {
            base,
            value_length: cursor.read_u32::<LittleEndian>().ok()?,
            value_offset: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    /// The attribute payload, bounds-checked against the raw attribute.
    pub fn value<'a>(&self, attr_data: &'a [u8]) -> Option<&'a [u8]> {
        let start = self.value_offset as usize;
        let end = start + self.value_length as usize;
        attr_data.get(start..end)
    }
}

#[derive(Debug, Clone)]
pub struct NonResidentAttributeHeader {
    pub base: AttributeHeader,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub data_runs_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

impl NonResidentAttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if !base.non_resident || data.len() < 64 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        let lowest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let highest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let data_runs_offset = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_unit = cursor.read_u16::<LittleEndian>().ok()?;
        let _padding = cursor.read_u32::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let initialized_size = cursor.read_u64::<LittleEndian>().ok()?;

        Some(Self {
            base,
            lowest_vcn,
            highest_vcn,
            data_runs_offset,
            compression_unit,
            allocated_size,
            data_size,
            initialized_size,
        })
    }
}

// ============================================================================
// Standard Information Attribute
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

impl StandardInformation {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 36 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            creation_time: cursor.read_u64::<LittleEndian>().ok()?,
            modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            mft_modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            access_time: cursor.read_u64::<LittleEndian>().ok()?,
            file_attributes: cursor.read_u32::<LittleEndian>().ok()?,
        })
    }
}

// ============================================================================
// File Name Attribute
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileNameAttribute {
    pub parent_reference: FileReference,
    pub creation_time: u64,
    pub modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub namespace: FilenameNamespace,
    pub name: String,
}

impl FileNameAttribute {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 66 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        let parent_raw = cursor.read_u64::<LittleEndian>().ok()?;
        let creation_time = cursor.read_u64::<LittleEndian>().ok()?;
        let modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let _mft_modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let access_time = cursor.read_u64::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let file_attributes = cursor.read_u32::<LittleEndian>().ok()?;
        let _reparse_value = cursor.read_u32::<LittleEndian>().ok()?;
        let name_length = cursor.read_u8().ok()?;
        let namespace = FilenameNamespace::from_u8(cursor.read_u8().ok()?)?;

        let name_bytes = name_length as usize * 2;
        if data.len() < 66 + name_bytes {
            return None;
        }
        let name = utf16le_to_string(&data[66..66 + name_bytes]);

        Some(Self {
            parent_reference: FileReference::from_raw(parent_raw),
            creation_time,
            modification_time,
            access_time,
            allocated_size,
            data_size,
            file_attributes,
            namespace,
            name,
        })
    }
}

// ============================================================================
// Attribute List Entry
// ============================================================================

/// Entry in an $ATTRIBUTE_LIST attribute. Present when a file has more
/// attributes than fit in one MFT record; each entry names the record
/// holding one attribute.
#[derive(Debug, Clone)]
pub struct AttributeListEntry {
    pub attribute_type: u32,
    pub entry_length: u16,
    pub starting_vcn: u64,
    /// Record holding the attribute (may be the base record itself)
    pub mft_reference: FileReference,
    pub attribute_id: u16,
}

impl AttributeListEntry {
    /// Parse one entry; returns the entry and the bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < 26 {
            return None;
        }

        let attribute_type = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let entry_length = u16::from_le_bytes(data[4..6].try_into().ok()?);
        let starting_vcn = u64::from_le_bytes(data[8..16].try_into().ok()?);
        let mft_reference = u64::from_le_bytes(data[16..24].try_into().ok()?);
        let attribute_id = u16::from_le_bytes(data[24..26].try_into().ok()?);

        if entry_length < 26 || entry_length as usize > data.len() {
            return None;
        }

        Some((
            Self {
                attribute_type,
                entry_length,
                starting_vcn,
                mft_reference: FileReference::from_raw(mft_reference),
                attribute_id,
            },
            entry_length as usize,
        ))
    }

    /// Does this entry live in a different record than its base?
    pub fn is_continuation(&self, base: FileReference) -> bool {
        self.mft_reference.record != base.record
    }
}

/// Parse all entries from an $ATTRIBUTE_LIST payload.
pub fn parse_attribute_list(data: &[u8]) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + 26 <= data.len() {
        match AttributeListEntry::from_bytes(&data[offset..]) {
            Some((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            None => break,
        }
    }

    entries
}

// ============================================================================
// Helpers
// ============================================================================

/// Decode an even-length UTF-16LE byte slice, lossily.
pub fn utf16le_to_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode a string as UTF-16LE bytes (used by the test image builder).
pub fn string_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Convert Windows FILETIME (100ns intervals since 1601) to Unix seconds.
pub fn filetime_to_unix(filetime: u64) -> i64 {
    const EPOCH_DIFF: u64 = 116444736000000000;

    if filetime < EPOCH_DIFF {
        return 0;
    }

    ((filetime - EPOCH_DIFF) / 10_000_000) as i64
}

/// Convert Windows FILETIME to a chrono DateTime.
pub fn filetime_to_datetime(filetime: u64) -> chrono::DateTime<chrono::Utc> {
    use chrono::{TimeZone, Utc};
    let unix_ts = filetime_to_unix(filetime);
    Utc.timestamp_opt(unix_ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}

// ============================================================================
// File Attributes
// ============================================================================

pub mod file_attributes {
    pub const READONLY: u32 = 0x00000001;
    pub const HIDDEN: u32 = 0x00000002;
    pub const SYSTEM: u32 = 0x00000004;
    pub const DIRECTORY: u32 = 0x00000010;
    pub const ARCHIVE: u32 = 0x00000020;
    pub const NORMAL: u32 = 0x00000080;
    pub const TEMPORARY: u32 = 0x00000100;
    pub const SPARSE_FILE: u32 = 0x00000200;
    pub const REPARSE_POINT: u32 = 0x00000400;
    pub const COMPRESSED: u32 = 0x00000800;
    pub const OFFLINE: u32 = 0x00001000;
    pub const ENCRYPTED: u32 = 0x00004000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_preference_never_picks_dos() {
        assert!(FilenameNamespace::Win32.beats(FilenameNamespace::Dos));
        assert!(FilenameNamespace::Win32.beats(FilenameNamespace::Win32AndDos));
        assert!(FilenameNamespace::Posix.beats(FilenameNamespace::Dos));
        assert!(!FilenameNamespace::Dos.beats(FilenameNamespace::Posix));
        assert!(!FilenameNamespace::Win32AndDos.beats(FilenameNamespace::Win32));
    }

    #[test]
    fn record_header_parses_sequence_and_flags() {
        let mut raw = vec![0u8; 48];
        raw[0..4].copy_from_slice(b"FILE");
        raw[4..6].copy_from_slice(&48u16.to_le_bytes()); // usa offset
        raw[6..8].copy_from_slice(&3u16.to_le_bytes()); // usa size
        raw[16..18].copy_from_slice(&9u16.to_le_bytes()); // sequence
        raw[20..22].copy_from_slice(&56u16.to_le_bytes()); // first attr
        raw[22..24].copy_from_slice(&(MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY).to_le_bytes());

        let header = MftRecordHeader::from_bytes(&raw).unwrap();
        assert!(header.is_valid());
        assert!(header.is_in_use());
        assert!(header.is_directory());
        assert!(header.is_base_record());
        assert_eq!(header.sequence_number, 9);
    }

    #[test]
    fn filename_attribute_round_trips_name() {
        let mut raw = vec![0u8; 66];
        let parent = FileReference::new(5, 5);
        raw[0..8].copy_from_slice(&parent.to_raw().to_le_bytes());
        raw[56..60].copy_from_slice(&file_attributes::ARCHIVE.to_le_bytes());
        let name = string_to_utf16le("héllo.txt");
        raw[64] = ("héllo.txt".encode_utf16().count()) as u8;
        raw[65] = FilenameNamespace::Win32 as u8;
        raw.extend_from_slice(&name);

        let parsed = FileNameAttribute::from_bytes(&raw).unwrap();
        assert_eq!(parsed.name, "héllo.txt");
        assert_eq!(parsed.parent_reference, parent);
        assert_eq!(parsed.namespace, FilenameNamespace::Win32);
    }

    #[test]
    fn attribute_list_stops_at_truncated_entry() {
        let mut data = Vec::new();
        // One valid 32-byte entry pointing at record 77.
        let mut entry = vec![0u8; 32];
        entry[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        entry[4..6].copy_from_slice(&32u16.to_le_bytes());
        entry[16..24].copy_from_slice(&FileReference::new(77, 2).to_raw().to_le_bytes());
        data.extend_from_slice(&entry);
        // Followed by garbage claiming a length beyond the buffer.
        let mut bad = vec![0u8; 26];
        bad[4..6].copy_from_slice(&500u16.to_le_bytes());
        data.extend_from_slice(&bad);

        let entries = parse_attribute_list(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mft_reference.record, 77);
        assert!(entries[0].is_continuation(FileReference::new(10, 1)));
    }
}
