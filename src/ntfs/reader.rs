//! MFT streaming
//!
//! The MFT is itself an NTFS file, and may be fragmented; its own run
//! list lives in record 0, which sits at a fixed, boot-sector-known
//! location. The reader bootstraps from there, then streams every
//! record slot through the parser as a lazy, single-pass sequence.
//! Record order matters: attribute-list continuation records are
//! resolved with a short-lived pending map consumed as the stream
//! progresses, so the sequence is non-restartable by design.

use crate::error::{MftScanError, Result};
use crate::ntfs::record::{ParsedRecord, RecordParser};
use crate::tree::{Fragment, Node};
use crate::volume::VolumeAccessor;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One contiguous piece of the MFT's own allocation.
#[derive(Debug, Clone, Copy)]
struct MftExtent {
    vcn: u64,
    lcn: u64,
    clusters: u64,
}

/// Streams every MFT record slot as parsed nodes.
///
/// Yields `Ok(Node)` per live file, `Err` for recoverable per-record
/// failures (the consumer counts them and continues). Unused slots are
/// skipped silently. Fatal failures only occur at construction, while
/// locating the MFT itself.
pub struct MftReader<'a> {
    volume: &'a VolumeAccessor,
    parser: RecordParser,
    extents: Vec<MftExtent>,
    total_records: u64,
    /// Next slot to read
    position: u64,
    /// First node ($MFT itself) parsed during bootstrap
    bootstrap_node: Option<Node>,
    /// Base records waiting for continuation records, by record index
    pending: HashMap<u64, PendingBase>,
    /// Order in which pending bases were first seen, for a
    /// deterministic end-of-stream flush
    pending_order: Vec<u64>,
    /// Extension records seen before their base, keyed by base index
    early_extensions: HashMap<u64, Vec<ParsedRecord>>,
    /// Nodes ready to emit ahead of the cursor
    ready: Vec<Node>,
    /// Read-ahead cache of raw record bytes
    batch: Vec<u8>,
    batch_start: u64,
    batch_len: u64,
    batch_size: usize,
}

struct PendingBase {
    record: ParsedRecord,
    awaiting: Vec<u64>,
}

impl<'a> MftReader<'a> {
    /// Locate the MFT and prepare the stream. Failures here are fatal:
    /// without record 0 there is no volume to enumerate.
    pub fn new(volume: &'a VolumeAccessor, batch_size: usize) -> Result<Self> {
        let geometry = volume.geometry();
        let record_size = geometry.mft_record_size as usize;

        let mut first = vec![0u8; record_size];
        volume
            .read_at(geometry.mft_byte_offset(), &mut first)
            .map_err(|e| MftScanError::MftLocation(format!("cannot read record 0: {}", e)))?;

        let parser = RecordParser::new(geometry);
        let parsed = parser
            .parse(0, &mut first)
            .map_err(|e| MftScanError::MftLocation(format!("record 0 unparseable: {}", e)))?;

        let mft_stream = parsed
            .streams
            .iter()
            .find(|s| s.is_default())
            .ok_or_else(|| {
                MftScanError::MftLocation("record 0 has no default data stream".into())
            })?;

        let mut extents = Vec::new();
        let mut vcn = 0u64;
        for fragment in &mft_stream.fragments {
            match *fragment {
                Fragment::Allocated { start_lcn, clusters } => {
                    extents.push(MftExtent {
                        vcn,
                        lcn: start_lcn,
                        clusters,
                    });
                    vcn += clusters;
                }
                Fragment::Sparse { clusters } => {
                    // A sparse MFT extent would mean unreadable record
                    // slots; nothing sane produces one.
                    warn!(clusters, "sparse extent in $MFT run list");
                    vcn += clusters;
                }
            }
        }
        if extents.is_empty() {
            return Err(MftScanError::MftLocation(
                "record 0 data stream has no allocated extents".into(),
            ));
        }

        let total_records = mft_stream.size / geometry.mft_record_size as u64;
        let max_records = geometry.volume_bytes() / geometry.mft_record_size as u64;
        if total_records > max_records {
            return Err(MftScanError::MftLocation(format!(
                "record 0 claims {} records but the volume holds at most {}",
                total_records, max_records
            )));
        }
        debug!(
            total_records,
            extents = extents.len(),
            "MFT located"
        );

        Ok(Self {
            volume,
            parser,
            extents,
            total_records,
            position: 1,
            bootstrap_node: Some(parsed.into_node()),
            pending: HashMap::new(),
            pending_order: Vec::new(),
            early_extensions: HashMap::new(),
            ready: Vec::new(),
            batch: Vec::new(),
            batch_start: 0,
            batch_len: 0,
            batch_size: batch_size.max(1),
        })
    }

    /// Total record slots in the MFT.
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Index of the next slot to be read. Stable across suspension.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Volume-relative byte offset of a record slot, mapped through the
    /// MFT's own extents.
    fn record_offset(&self, record_number: u64) -> u64 {
        let geometry = self.volume.geometry();
        let record_size = geometry.mft_record_size as u64;
        let cluster_size = geometry.bytes_per_cluster() as u64;
        let byte_vcn_offset = record_number * record_size;
        let target_vcn = byte_vcn_offset / cluster_size;
        let within_cluster = byte_vcn_offset % cluster_size;

        for extent in &self.extents {
            if target_vcn >= extent.vcn && target_vcn < extent.vcn + extent.clusters {
                let lcn = extent.lcn + (target_vcn - extent.vcn);
                return lcn * cluster_size + within_cluster;
            }
        }
        // Off the end of the run list: fall back to a flat layout from
        // the first extent.
        self.extents[0].lcn * cluster_size + byte_vcn_offset
    }

    /// Fill the read-ahead cache starting at `slot` with as many
    /// physically contiguous records as fit in one read.
    fn fill_batch(&mut self, slot: u64) -> Result<()> {
        let record_size = self.volume.geometry().mft_record_size as u64;
        let start_offset = self.record_offset(slot);

        let max = (self.batch_size as u64).min(self.total_records - slot);
        let mut contiguous = 1u64;
        while contiguous < max
            && self.record_offset(slot + contiguous) == start_offset + contiguous * record_size
        {
            contiguous += 1;
        }

        let byte_len = (contiguous * record_size) as usize;
        if self.batch.len() < byte_len {
            self.batch.resize(byte_len, 0);
        }
        self.volume
            .read_at(start_offset, &mut self.batch[..byte_len])
            .map_err(|e| match e {
                MftScanError::Io(io) => MftScanError::UnreadableRecord(slot, io),
                other => other,
            })?;
        self.batch_start = slot;
        self.batch_len = contiguous;
        Ok(())
    }

    /// Raw bytes for one slot, via the cache.
    fn record_bytes(&mut self, slot: u64) -> Result<Vec<u8>> {
        if slot < self.batch_start || slot >= self.batch_start + self.batch_len {
            self.fill_batch(slot)?;
        }
        let record_size = self.volume.geometry().mft_record_size as usize;
        let start = (slot - self.batch_start) as usize * record_size;
        Ok(self.batch[start..start + record_size].to_vec())
    }

    /// Route one parsed record through the continuation machinery,
    /// pushing any now-complete nodes onto `ready`.
    fn accept(&mut self, parsed: ParsedRecord) {
        if let Some(base_ref) = parsed.base {
            // Extension record: merge into its pending base, or stash
            // until the base arrives. The full reference must match;
            // a stale sequence means the base slot was reused and the
            // extension is leftover garbage.
            match self.pending.get_mut(&base_ref.record) {
                Some(pending) if pending.record.reference == base_ref => {
                    pending.awaiting.retain(|&r| r != parsed.reference.record);
                    pending.record.merge_extension(parsed);
                    if pending.awaiting.is_empty() {
                        let done = self.pending.remove(&base_ref.record).unwrap();
                        self.pending_order.retain(|&r| r != base_ref.record);
                        self.ready.push(done.record.into_node());
                    }
                }
                Some(pending) => {
                    warn!(
                        record = parsed.reference.record,
                        base = base_ref.record,
                        expected_sequence = pending.record.reference.sequence,
                        stale_sequence = base_ref.sequence,
                        "extension references a stale base sequence; ignoring"
                    );
                }
                None => {
                    self.early_extensions
                        .entry(base_ref.record)
                        .or_default()
                        .push(parsed);
                }
            }
            return;
        }

        let mut base = parsed;
        if let Some(early) = self.early_extensions.remove(&base.reference.record) {
            for ext in early {
                if ext.base == Some(base.reference) {
                    base.merge_extension(ext);
                } else {
                    warn!(
                        record = ext.reference.record,
                        base = base.reference.record,
                        "extension references a stale base sequence; ignoring"
                    );
                }
            }
        }

        // Still-unseen continuation records must lie ahead of the
        // cursor; anything behind it was deleted or already merged.
        let awaiting: Vec<u64> = base
            .continuations
            .iter()
            .map(|r| r.record)
            .filter(|&r| r >= self.position)
            .collect();

        if awaiting.is_empty() {
            self.ready.push(base.into_node());
        } else {
            self.pending_order.push(base.reference.record);
            self.pending.insert(
                base.reference.record,
                PendingBase {
                    record: base,
                    awaiting,
                },
            );
        }
    }

    /// Emit bases whose continuations never materialized.
    fn flush_pending(&mut self) {
        for record in std::mem::take(&mut self.pending_order) {
            if let Some(pending) = self.pending.remove(&record) {
                warn!(
                    record,
                    missing = pending.awaiting.len(),
                    "continuation records never arrived; emitting base as-is"
                );
                self.ready.push(pending.record.into_node());
            }
        }
        self.early_extensions.clear();
    }
}

impl Iterator for MftReader<'_> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.bootstrap_node.take() {
                return Some(Ok(node));
            }
            if !self.ready.is_empty() {
                return Some(Ok(self.ready.remove(0)));
            }
            if self.position >= self.total_records {
                if self.pending.is_empty() && self.early_extensions.is_empty() {
                    return None;
                }
                self.flush_pending();
                continue;
            }

            let slot = self.position;
            self.position += 1;

            let mut raw = match self.record_bytes(slot) {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };

            // Never-written slots are zero-filled; skip without noise.
            if raw.iter().all(|&b| b == 0) {
                continue;
            }

            match self.parser.parse(slot, &mut raw) {
                Ok(parsed) if !parsed.in_use => continue,
                Ok(parsed) => self.accept(parsed),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
