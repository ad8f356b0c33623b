//! MFT record parsing
//!
//! Turns one fixed-size raw record into a partial node plus its streams.
//! The fix-up (update sequence array) is verified and repaired first: a
//! mismatched sector tail means a torn write, and the record is reported
//! as corrupt rather than parsed into wrong totals.

use crate::error::{MftScanError, Result};
use crate::ntfs::runlist;
use crate::ntfs::structs::*;
use crate::tree::{FileReference, Fragment, Node, Stream};
use crate::volume::VolumeGeometry;
use tracing::warn;

/// One parsed MFT record: a partial node, its streams, and any
/// attribute-list continuation references still to be resolved. The
/// parent reference is not yet known to be valid.
#[derive(Debug, Clone, Default)]
pub struct ParsedRecord {
    pub reference: FileReference,
    /// Set when this is an extension record belonging to another base
    pub base: Option<FileReference>,
    pub in_use: bool,
    pub is_directory: bool,
    pub attributes: u32,
    pub name: Option<(FilenameNamespace, String)>,
    pub parent: Option<FileReference>,
    pub streams: Vec<Stream>,
    /// Records named by an $ATTRIBUTE_LIST that hold further attributes
    pub continuations: Vec<FileReference>,
    pub creation_time: u64,
    pub modification_time: u64,
    pub access_time: u64,
}

impl ParsedRecord {
    pub fn into_node(self) -> Node {
        Node {
            reference: self.reference,
            parent_reference: self.parent.unwrap_or_default(),
            name: self.name.map(|(_, n)| n).unwrap_or_default(),
            attributes: self.attributes,
            is_directory: self.is_directory,
            streams: self.streams,
            creation_time: self.creation_time,
            modification_time: self.modification_time,
            access_time: self.access_time,
            ..Default::default()
        }
    }

    /// Fold an extension record's attributes into this base record.
    /// Streams with the same name are one attribute split across
    /// records: the extension contributes further fragments, while the
    /// byte sizes are only valid in the first extent.
    pub fn merge_extension(&mut self, ext: ParsedRecord) {
        if self.name.is_none() {
            self.name = ext.name;
            self.parent = self.parent.or(ext.parent);
        }
        for stream in ext.streams {
            match self.streams.iter_mut().find(|s| s.name == stream.name) {
                Some(existing) => {
                    existing.fragments.extend(stream.fragments);
                    if existing.size == 0 {
                        existing.size = stream.size;
                        existing.allocated_size = stream.allocated_size;
                    }
                }
                None => self.streams.push(stream),
            }
        }
        self.continuations.extend(ext.continuations);
    }
}

/// Stateless parser for fixed-size MFT records.
pub struct RecordParser {
    geometry: VolumeGeometry,
}

impl RecordParser {
    pub fn new(geometry: VolumeGeometry) -> Self {
        Self { geometry }
    }

    /// Parse a raw record buffer. The buffer is mutated in place by the
    /// fix-up repair. Corruption surfaces as `CorruptRecord`; the caller
    /// skips the record and continues the scan.
    pub fn parse(&self, record_number: u64, data: &mut [u8]) -> Result<ParsedRecord> {
        let header = MftRecordHeader::from_bytes(data).ok_or_else(|| {
            MftScanError::CorruptRecord(record_number, "record too short for header".into())
        })?;

        if header.signature == MFT_RECORD_BAD_SIGNATURE {
            return Err(MftScanError::CorruptRecord(
                record_number,
                "BAAD signature".into(),
            ));
        }
        if !header.is_valid() {
            return Err(MftScanError::CorruptRecord(
                record_number,
                format!("bad signature {:#010x}", header.signature),
            ));
        }

        self.apply_fixup(record_number, data, &header)?;

        let mut parsed = ParsedRecord {
            reference: FileReference::new(record_number, header.sequence_number),
            base: (!header.is_base_record()).then(|| header.base_reference()),
            in_use: header.is_in_use(),
            is_directory: header.is_directory(),
            ..Default::default()
        };

        if !parsed.in_use {
            return Ok(parsed);
        }

        self.parse_attributes(data, &header, &mut parsed)?;
        Ok(parsed)
    }

    /// Verify and undo the update sequence array. NTFS stores the last
    /// two bytes of each sector in the array and overwrites them with a
    /// signature; a tail that no longer matches means a partial write.
    fn apply_fixup(
        &self,
        record_number: u64,
        data: &mut [u8],
        header: &MftRecordHeader,
    ) -> Result<()> {
        let sector_size = self.geometry.bytes_per_sector as usize;
        let usa_offset = header.update_sequence_offset as usize;
        let usa_count = header.update_sequence_size as usize;

        if usa_count == 0 {
            return Ok(());
        }
        if usa_offset + usa_count * 2 > data.len() {
            return Err(MftScanError::CorruptRecord(
                record_number,
                "update sequence array out of bounds".into(),
            ));
        }

        let signature = u16::from_le_bytes([data[usa_offset], data[usa_offset + 1]]);

        for i in 1..usa_count {
            let sector_end = i * sector_size - 2;
            let fixup_offset = usa_offset + i * 2;
            if sector_end + 2 > data.len() {
                break;
            }

            let stored = u16::from_le_bytes([data[sector_end], data[sector_end + 1]]);
            if stored != signature {
                return Err(MftScanError::CorruptRecord(
                    record_number,
                    format!(
                        "fix-up mismatch in sector {}: {:#06x} != {:#06x}",
                        i, stored, signature
                    ),
                ));
            }

            data[sector_end] = data[fixup_offset];
            data[sector_end + 1] = data[fixup_offset + 1];
        }

        Ok(())
    }

    fn parse_attributes(
        &self,
        data: &[u8],
        header: &MftRecordHeader,
        parsed: &mut ParsedRecord,
    ) -> Result<()> {
        let mut offset = header.first_attribute_offset as usize;
        let end = (header.used_size as usize).min(data.len());

        while offset + 16 <= end {
            let attr_header = AttributeHeader::from_bytes(&data[offset..]).ok_or_else(|| {
                MftScanError::CorruptRecord(
                    parsed.reference.record,
                    format!("unparseable attribute header at offset {}", offset),
                )
            })?;

            if attr_header.attribute_type == ATTRIBUTE_END_MARKER {
                break;
            }
            if attr_header.length == 0 || offset + attr_header.length as usize > data.len() {
                return Err(MftScanError::CorruptRecord(
                    parsed.reference.record,
                    format!("attribute length {} overruns record", attr_header.length),
                ));
            }

            let attr_data = &data[offset..offset + attr_header.length as usize];

            match AttributeType::from_u32(attr_header.attribute_type) {
                Some(AttributeType::StandardInformation) => {
                    self.parse_standard_information(attr_data, parsed);
                }
                Some(AttributeType::FileName) => {
                    self.parse_filename(attr_data, parsed);
                }
                Some(AttributeType::Data) => {
                    self.parse_data(attr_data, &attr_header, parsed)?;
                }
                Some(AttributeType::AttributeList) => {
                    self.parse_attribute_list_attr(attr_data, &attr_header, parsed);
                }
                _ => {
                    // Index roots, bitmaps, security descriptors and the
                    // rest carry no size information we track.
                }
            }

            offset += attr_header.length as usize;
        }

        Ok(())
    }

    fn parse_standard_information(&self, attr_data: &[u8], parsed: &mut ParsedRecord) {
        let Some(header) = ResidentAttributeHeader::from_bytes(attr_data) else {
            return;
        };
        let Some(content) = header.value(attr_data) else {
            return;
        };
        if let Some(si) = StandardInformation::from_bytes(content) {
            parsed.attributes = si.file_attributes;
            parsed.creation_time = si.creation_time;
            parsed.modification_time = si.modification_time;
            parsed.access_time = si.access_time;
            parsed.is_directory =
                parsed.is_directory || (si.file_attributes & file_attributes::DIRECTORY) != 0;
        }
    }

    /// Keep the long/primary name, never an 8.3 short alias, when both
    /// exist. The parent reference follows the winning name.
    fn parse_filename(&self, attr_data: &[u8], parsed: &mut ParsedRecord) {
        let Some(header) = ResidentAttributeHeader::from_bytes(attr_data) else {
            return;
        };
        let Some(content) = header.value(attr_data) else {
            return;
        };
        let Some(fn_attr) = FileNameAttribute::from_bytes(content) else {
            return;
        };

        let wins = match &parsed.name {
            None => true,
            Some((current_ns, _)) => fn_attr.namespace.beats(*current_ns),
        };
        if wins {
            parsed.name = Some((fn_attr.namespace, fn_attr.name));
            parsed.parent = Some(fn_attr.parent_reference);
        }
    }

    fn parse_data(
        &self,
        attr_data: &[u8],
        attr_header: &AttributeHeader,
        parsed: &mut ParsedRecord,
    ) -> Result<()> {
        let name = attr_header.name(attr_data).unwrap_or_default();

        if attr_header.non_resident {
            let Some(nr) = NonResidentAttributeHeader::from_bytes(attr_data) else {
                return Err(MftScanError::CorruptRecord(
                    parsed.reference.record,
                    "truncated non-resident data attribute".into(),
                ));
            };

            let runs_offset = nr.data_runs_offset as usize;
            if runs_offset > attr_data.len() {
                return Err(MftScanError::CorruptRecord(
                    parsed.reference.record,
                    "run list offset outside attribute".into(),
                ));
            }
            let fragments: Vec<Fragment> = runlist::decode_runs(&attr_data[runs_offset..])?;

            // In a split attribute only the first extent carries sizes.
            let first_extent = nr.lowest_vcn == 0;
            parsed.streams.push(Stream {
                name,
                size: if first_extent { nr.data_size } else { 0 },
                allocated_size: if first_extent { nr.allocated_size } else { 0 },
                fragments,
                resident: false,
            });
        } else {
            let Some(r) = ResidentAttributeHeader::from_bytes(attr_data) else {
                return Err(MftScanError::CorruptRecord(
                    parsed.reference.record,
                    "truncated resident data attribute".into(),
                ));
            };
            parsed.streams.push(Stream {
                name,
                size: r.value_length as u64,
                allocated_size: 0,
                fragments: Vec::new(),
                resident: true,
            });
        }

        Ok(())
    }

    fn parse_attribute_list_attr(
        &self,
        attr_data: &[u8],
        attr_header: &AttributeHeader,
        parsed: &mut ParsedRecord,
    ) {
        if attr_header.non_resident {
            // A non-resident $ATTRIBUTE_LIST would require another
            // cluster read mid-record; rare enough to degrade to a
            // warning, the base record's own attributes still count.
            warn!(
                record = parsed.reference.record,
                "non-resident attribute list skipped"
            );
            return;
        }
        let Some(header) = ResidentAttributeHeader::from_bytes(attr_data) else {
            return;
        };
        let Some(content) = header.value(attr_data) else {
            return;
        };
        for entry in parse_attribute_list(content) {
            if entry.is_continuation(parsed.reference)
                && !parsed.continuations.contains(&entry.mft_reference)
            {
                parsed.continuations.push(entry.mft_reference);
            }
        }
    }
}
