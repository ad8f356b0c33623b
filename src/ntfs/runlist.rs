//! Run list decoding
//!
//! A non-resident attribute describes its cluster allocation as a
//! sequence of runs. Each run starts with a header byte: low nibble is
//! the byte width of the cluster-count field, high nibble the byte width
//! of the signed LCN-delta field. A zero header byte terminates the
//! list; a zero delta width with a nonzero count is a sparse run. Each
//! delta is relative to the previous run's start (volume cluster 0 for
//! the first run), so runs can jump backwards.

use crate::error::{MftScanError, Result};
use crate::tree::Fragment;

/// Decode a run list into ordered fragments.
///
/// Truncated fields, field widths over 8 bytes, zero-length runs and
/// negative absolute cluster positions all fail with `MalformedRunList`;
/// the caller aborts only the owning record, never the whole scan.
pub fn decode_runs(data: &[u8]) -> Result<Vec<Fragment>> {
    let mut fragments = Vec::new();
    let mut pos = 0usize;
    let mut current_lcn: i64 = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            return Ok(fragments);
        }

        let count_width = (header & 0x0F) as usize;
        let delta_width = ((header >> 4) & 0x0F) as usize;
        pos += 1;

        if count_width == 0 || count_width > 8 || delta_width > 8 {
            return Err(MftScanError::MalformedRunList(format!(
                "invalid field widths in header byte {:#04x}",
                header
            )));
        }
        if pos + count_width + delta_width > data.len() {
            return Err(MftScanError::MalformedRunList(format!(
                "run fields overflow attribute: need {} bytes, {} remain",
                count_width + delta_width,
                data.len() - pos
            )));
        }

        let mut clusters = 0u64;
        for i in 0..count_width {
            clusters |= (data[pos + i] as u64) << (i * 8);
        }
        pos += count_width;

        // Count fields are unsigned, but a set high bit in the widest
        // encoding is the on-disk representation of a negative count.
        if clusters == 0 || (count_width == 8 && (clusters as i64) < 0) {
            return Err(MftScanError::MalformedRunList(format!(
                "run decodes to invalid cluster count {}",
                clusters as i64
            )));
        }

        if delta_width == 0 {
            // Sparse run: logical clusters with no physical backing.
            fragments.push(Fragment::Sparse { clusters });
            continue;
        }

        let mut delta = 0i64;
        for i in 0..delta_width {
            delta |= (data[pos + i] as i64) << (i * 8);
        }
        // Sign-extend if the top bit of the widest byte is set.
        if delta_width < 8 && (data[pos + delta_width - 1] & 0x80) != 0 {
            delta |= -1i64 << (delta_width * 8);
        }
        pos += delta_width;

        current_lcn += delta;
        if current_lcn < 0 {
            return Err(MftScanError::MalformedRunList(format!(
                "run start decodes to negative cluster {}",
                current_lcn
            )));
        }

        fragments.push(Fragment::Allocated {
            start_lcn: current_lcn as u64,
            clusters,
        });
    }

    // Running off the end without seeing the terminator is tolerated:
    // NTFS pads the last run up to the attribute length.
    Ok(fragments)
}

/// Encode fragments back into run-list bytes, minimal field widths.
/// Inverse of `decode_runs` up to cluster equality (not byte identity).
pub fn encode_runs(fragments: &[Fragment]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev_lcn: i64 = 0;

    for fragment in fragments {
        match *fragment {
            Fragment::Sparse { clusters } => {
                let count = unsigned_bytes(clusters);
                out.push(count.len() as u8);
                out.extend_from_slice(&count);
            }
            Fragment::Allocated { start_lcn, clusters } => {
                let count = unsigned_bytes(clusters);
                let delta = signed_bytes(start_lcn as i64 - prev_lcn);
                out.push(((delta.len() as u8) << 4) | count.len() as u8);
                out.extend_from_slice(&count);
                out.extend_from_slice(&delta);
                prev_lcn = start_lcn as i64;
            }
        }
    }

    out.push(0);
    out
}

/// Minimal little-endian encoding of an unsigned value (at least 1 byte).
fn unsigned_bytes(value: u64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 && *bytes.last().unwrap() == 0 {
        bytes.pop();
    }
    // Widen by one zero byte if the result would sign-extend negative.
    if bytes.len() < 8 && bytes.last().unwrap() & 0x80 != 0 {
        bytes.push(0);
    }
    bytes
}

/// Minimal little-endian two's-complement encoding of a signed value.
fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let mut len = 8;
    while len > 1 {
        let truncated = &bytes[..len - 1];
        let sign_ok = if truncated.last().unwrap() & 0x80 != 0 {
            value < 0 && bytes[len - 1] == 0xFF
        } else {
            value >= 0 && bytes[len - 1] == 0x00
        };
        if !sign_ok {
            break;
        }
        len -= 1;
    }
    bytes[..len].to_vec()
}
