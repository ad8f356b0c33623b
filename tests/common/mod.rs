//! Synthetic NTFS volume images for end-to-end tests.
//!
//! Builds a sparse temp file containing a real boot sector and a real
//! MFT: fixed-up 1024-byte records with $STANDARD_INFORMATION,
//! $FILE_NAME and $DATA attributes encoded exactly as NTFS lays them
//! out. Slots never written stay zero-filled, which the scanner skips.

#![allow(dead_code)]

use mftscan::{encode_runs, FileReference, Fragment};
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

pub const SECTOR: usize = 512;
pub const CLUSTER: u64 = 4096;
pub const RECORD_SIZE: usize = 1024;

pub const ROOT: u64 = 5;
pub const ROOT_SEQ: u16 = 5;

/// Windows FILETIME for 2024-01-01T00:00:00Z.
pub const FILETIME_2024: u64 = 133485408000000000;

pub fn root_ref() -> FileReference {
    FileReference::new(ROOT, ROOT_SEQ)
}

// ----------------------------------------------------------------------------
// Record builder
// ----------------------------------------------------------------------------

const IN_USE: u16 = 0x0001;
const IS_DIRECTORY: u16 = 0x0002;
const END_MARKER: u32 = 0xFFFF_FFFF;
const FIRST_ATTR: usize = 56;

pub struct RecordBuilder {
    sequence: u16,
    flags: u16,
    base_reference: u64,
    attrs: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub fn file(sequence: u16) -> Self {
        Self {
            sequence,
            flags: IN_USE,
            base_reference: 0,
            attrs: Vec::new(),
        }
    }

    pub fn directory(sequence: u16) -> Self {
        Self {
            sequence,
            flags: IN_USE | IS_DIRECTORY,
            base_reference: 0,
            attrs: Vec::new(),
        }
    }

    /// Extension record belonging to `base`.
    pub fn extension(sequence: u16, base: FileReference) -> Self {
        Self {
            sequence,
            flags: IN_USE,
            base_reference: base.to_raw(),
            attrs: Vec::new(),
        }
    }

    pub fn standard_information(mut self, file_attributes: u32, filetime: u64) -> Self {
        let mut value = vec![0u8; 48];
        value[0..8].copy_from_slice(&filetime.to_le_bytes()); // creation
        value[8..16].copy_from_slice(&filetime.to_le_bytes()); // modification
        value[16..24].copy_from_slice(&filetime.to_le_bytes()); // mft modification
        value[24..32].copy_from_slice(&filetime.to_le_bytes()); // access
        value[32..36].copy_from_slice(&file_attributes.to_le_bytes());
        self.attrs.push(resident_attr(0x10, &value));
        self
    }

    pub fn file_name(mut self, parent: FileReference, name: &str) -> Self {
        let utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut value = vec![0u8; 66 + utf16.len()];
        value[0..8].copy_from_slice(&parent.to_raw().to_le_bytes());
        value[64] = name.encode_utf16().count() as u8;
        value[65] = 1; // Win32 namespace
        value[66..].copy_from_slice(&utf16);
        self.attrs.push(resident_attr(0x30, &value));
        self
    }

    /// Small payload stored inline in the record.
    pub fn resident_data(mut self, size: usize) -> Self {
        self.attrs.push(resident_attr(0x80, &vec![0xABu8; size]));
        self
    }

    /// Non-resident default data stream with the given fragment layout.
    pub fn data(mut self, size: u64, fragments: &[Fragment]) -> Self {
        self.attrs.push(non_resident_data(size, 0, fragments));
        self
    }

    /// A later extent of a split data attribute: carries fragments only,
    /// sizes belong to the first extent.
    pub fn data_extent(mut self, lowest_vcn: u64, fragments: &[Fragment]) -> Self {
        self.attrs.push(non_resident_data(0, lowest_vcn, fragments));
        self
    }

    /// Resident $ATTRIBUTE_LIST naming the records holding further
    /// attributes.
    pub fn attribute_list(mut self, entries: &[(u32, FileReference)]) -> Self {
        let mut value = Vec::new();
        for &(attr_type, reference) in entries {
            let mut entry = vec![0u8; 32];
            entry[0..4].copy_from_slice(&attr_type.to_le_bytes());
            entry[4..6].copy_from_slice(&32u16.to_le_bytes());
            entry[16..24].copy_from_slice(&reference.to_raw().to_le_bytes());
            value.extend_from_slice(&entry);
        }
        self.attrs.push(resident_attr(0x20, &value));
        self
    }

    /// Serialize into a fixed-up raw record.
    pub fn build(self) -> Vec<u8> {
        let mut rec = vec![0u8; RECORD_SIZE];
        rec[0..4].copy_from_slice(b"FILE");
        rec[4..6].copy_from_slice(&48u16.to_le_bytes()); // USA offset
        rec[6..8].copy_from_slice(&3u16.to_le_bytes()); // USA entries
        rec[16..18].copy_from_slice(&self.sequence.to_le_bytes());
        rec[20..22].copy_from_slice(&(FIRST_ATTR as u16).to_le_bytes());
        rec[22..24].copy_from_slice(&self.flags.to_le_bytes());
        rec[32..40].copy_from_slice(&self.base_reference.to_le_bytes());

        let mut offset = FIRST_ATTR;
        for attr in &self.attrs {
            rec[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        rec[offset..offset + 4].copy_from_slice(&END_MARKER.to_le_bytes());
        offset += 8;
        rec[24..28].copy_from_slice(&(offset as u32).to_le_bytes()); // used size
        rec[28..32].copy_from_slice(&(RECORD_SIZE as u32).to_le_bytes());

        apply_fixup(&mut rec, 0x1137);
        rec
    }

    /// A record whose second sector tail disagrees with the update
    /// sequence signature, as a torn write leaves it.
    pub fn build_torn(self) -> Vec<u8> {
        let mut rec = self.build();
        let tail = 2 * SECTOR - 2;
        rec[tail..tail + 2].copy_from_slice(&0xDEADu16.to_le_bytes());
        rec
    }
}

fn resident_attr(attr_type: u32, value: &[u8]) -> Vec<u8> {
    let total = (24 + value.len() + 7) & !7;
    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&attr_type.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&24u16.to_le_bytes()); // value offset
    attr[24..24 + value.len()].copy_from_slice(value);
    attr
}

fn non_resident_data(size: u64, lowest_vcn: u64, fragments: &[Fragment]) -> Vec<u8> {
    let runs = encode_runs(fragments);
    let total = (64 + runs.len() + 7) & !7;
    let clusters: u64 = fragments.iter().map(Fragment::clusters).sum();

    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&0x80u32.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 1; // non-resident
    attr[16..24].copy_from_slice(&lowest_vcn.to_le_bytes());
    attr[24..32].copy_from_slice(&(lowest_vcn + clusters.saturating_sub(1)).to_le_bytes());
    attr[32..34].copy_from_slice(&64u16.to_le_bytes()); // runs offset
    attr[40..48].copy_from_slice(&(clusters * CLUSTER).to_le_bytes()); // allocated
    attr[48..56].copy_from_slice(&size.to_le_bytes());
    attr[56..64].copy_from_slice(&size.to_le_bytes()); // initialized
    attr[64..64 + runs.len()].copy_from_slice(&runs);
    attr
}

fn apply_fixup(rec: &mut [u8], signature: u16) {
    rec[48..50].copy_from_slice(&signature.to_le_bytes());
    for i in 1..3usize {
        let tail = i * SECTOR - 2;
        let fixup = 48 + i * 2;
        rec[fixup] = rec[tail];
        rec[fixup + 1] = rec[tail + 1];
        rec[tail..tail + 2].copy_from_slice(&signature.to_le_bytes());
    }
}

// ----------------------------------------------------------------------------
// Volume image builder
// ----------------------------------------------------------------------------

pub struct VolumeImageBuilder {
    /// MFT allocation as (lcn, clusters) extents, in VCN order.
    mft_extents: Vec<(u64, u64)>,
    total_records: u64,
    records: HashMap<u64, Vec<u8>>,
}

impl VolumeImageBuilder {
    /// A volume whose MFT occupies one contiguous extent at `mft_lcn`,
    /// sized for `total_records` slots.
    pub fn new(mft_lcn: u64, total_records: u64) -> Self {
        let clusters = (total_records * RECORD_SIZE as u64).div_ceil(CLUSTER);
        Self {
            mft_extents: vec![(mft_lcn, clusters)],
            total_records,
            records: HashMap::new(),
        }
    }

    /// A volume with a fragmented MFT.
    pub fn with_extents(extents: Vec<(u64, u64)>, total_records: u64) -> Self {
        Self {
            mft_extents: extents,
            total_records,
            records: HashMap::new(),
        }
    }

    /// Standard scaffolding: record 0 describing the MFT itself, and
    /// the root directory at record 5.
    pub fn with_system_records(mut self) -> Self {
        let mft_fragments: Vec<Fragment> = self
            .mft_extents
            .iter()
            .map(|&(lcn, clusters)| Fragment::Allocated {
                start_lcn: lcn,
                clusters,
            })
            .collect();
        let mft_size = self.total_records * RECORD_SIZE as u64;
        self.put(
            0,
            RecordBuilder::file(1)
                .standard_information(0x06, FILETIME_2024)
                .file_name(root_ref(), "$MFT")
                .data(mft_size, &mft_fragments)
                .build(),
        );
        self.put(
            ROOT,
            RecordBuilder::directory(ROOT_SEQ)
                .standard_information(0x10, FILETIME_2024)
                .file_name(root_ref(), ".")
                .build(),
        );
        self
    }

    pub fn put(&mut self, slot: u64, raw: Vec<u8>) -> &mut Self {
        assert!(slot < self.total_records, "slot outside MFT");
        assert_eq!(raw.len(), RECORD_SIZE);
        self.records.insert(slot, raw);
        self
    }

    pub fn record(mut self, slot: u64, builder: RecordBuilder) -> Self {
        self.put(slot, builder.build());
        self
    }

    pub fn torn_record(mut self, slot: u64, builder: RecordBuilder) -> Self {
        self.put(slot, builder.build_torn());
        self
    }

    /// Byte offset of a record slot, through the MFT's own extents.
    fn slot_offset(&self, slot: u64) -> u64 {
        let byte_vcn_offset = slot * RECORD_SIZE as u64;
        let target_vcn = byte_vcn_offset / CLUSTER;
        let within = byte_vcn_offset % CLUSTER;

        let mut vcn = 0u64;
        for &(lcn, clusters) in &self.mft_extents {
            if target_vcn < vcn + clusters {
                return (lcn + target_vcn - vcn) * CLUSTER + within;
            }
            vcn += clusters;
        }
        panic!("slot {} beyond MFT extents", slot);
    }

    /// Write the image out as a sparse temp file.
    pub fn build(self) -> NamedTempFile {
        let mut image = NamedTempFile::new().expect("create image file");

        let mut boot = [0u8; 512];
        boot[0x03..0x0B].copy_from_slice(b"NTFS    ");
        boot[0x0B..0x0D].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        boot[0x0D] = (CLUSTER / SECTOR as u64) as u8;
        boot[0x28..0x30].copy_from_slice(&0x0040_0000u64.to_le_bytes()); // total sectors
        boot[0x30..0x38].copy_from_slice(&self.mft_extents[0].0.to_le_bytes());
        boot[0x40] = (-10i8) as u8; // 2^10 = 1024-byte records
        boot[0x48..0x50].copy_from_slice(&0xC0FF_EE00_1234u64.to_le_bytes());
        image.write_all(&boot).expect("write boot sector");

        let mut end = 512u64;
        for (&slot, raw) in &self.records {
            let offset = self.slot_offset(slot);
            image
                .as_file_mut()
                .seek(SeekFrom::Start(offset))
                .expect("seek record slot");
            image.write_all(raw).expect("write record");
            end = end.max(offset + RECORD_SIZE as u64);
        }

        // Cover every slot, including never-written (zero) ones.
        let last = self.slot_offset(self.total_records - 1) + RECORD_SIZE as u64;
        image
            .as_file()
            .set_len(end.max(last))
            .expect("extend image");
        image
    }
}
