//! Raw volume access
//!
//! Opens read-only raw access to an NTFS volume (`\\.\C:` on Windows, a
//! block device or volume image elsewhere), reads and validates the boot
//! sector, and serves sector-aligned byte-range reads. The handle is
//! plain RAII: dropping the accessor releases it on every exit path,
//! including cancellation.

use crate::error::{MftScanError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

/// Cluster/sector geometry derived once from the boot sector, read-only
/// for the lifetime of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    /// Total sectors in the volume, per the boot sector
    pub total_sectors: u64,
    /// LCN of the $MFT's first cluster
    pub mft_start_cluster: u64,
    /// Size of one MFT record in bytes
    pub mft_record_size: u32,
}

impl VolumeGeometry {
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Total volume size in bytes. Upper bound for any on-volume
    /// structure; sizes claimed by MFT records are checked against it.
    pub fn volume_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(self.bytes_per_sector as u64)
    }

    /// Byte offset of the MFT's first record, assuming the first extent.
    pub fn mft_byte_offset(&self) -> u64 {
        self.mft_start_cluster * self.bytes_per_cluster() as u64
    }
}

// ============================================================================
// NTFS Boot Sector
// ============================================================================

/// Parsed NTFS boot sector (first 512 bytes of the volume).
#[derive(Debug, Clone)]
pub struct NtfsBootSector {
    /// Must be "NTFS    " (8 bytes at offset 0x03)
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    /// LCN of $MFT (offset 0x30)
    pub mft_cluster_number: u64,
    /// LCN of $MFTMirr (offset 0x38)
    pub mft_mirror_cluster_number: u64,
    /// Clusters per MFT record (offset 0x40, signed):
    /// negative means record size = 2^|value| bytes
    pub clusters_per_mft_record: i8,
    pub volume_serial_number: u64,
}

impl NtfsBootSector {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 0x50 {
            return None;
        }

        let mut oem_id = [0u8; 8];
        oem_id.copy_from_slice(&data[0x03..0x0B]);

        Some(Self {
            oem_id,
            bytes_per_sector: u16::from_le_bytes(data[0x0B..0x0D].try_into().ok()?),
            sectors_per_cluster: data[0x0D],
            total_sectors: u64::from_le_bytes(data[0x28..0x30].try_into().ok()?),
            mft_cluster_number: u64::from_le_bytes(data[0x30..0x38].try_into().ok()?),
            mft_mirror_cluster_number: u64::from_le_bytes(data[0x38..0x40].try_into().ok()?),
            clusters_per_mft_record: data[0x40] as i8,
            volume_serial_number: u64::from_le_bytes(data[0x48..0x50].try_into().ok()?),
        })
    }

    pub fn is_valid_ntfs(&self) -> bool {
        &self.oem_id == b"NTFS    "
            && self.bytes_per_sector >= 256
            && self.bytes_per_sector.is_power_of_two()
            && self.sectors_per_cluster > 0
            && self.sectors_per_cluster.is_power_of_two()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Negative `clusters_per_mft_record` encodes 2^|value| bytes;
    /// positive is a plain cluster count.
    pub fn bytes_per_mft_record(&self) -> u32 {
        if self.clusters_per_mft_record < 0 {
            1u32 << (-self.clusters_per_mft_record as u32)
        } else {
            self.clusters_per_mft_record as u32 * self.bytes_per_cluster()
        }
    }

    pub fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            bytes_per_sector: self.bytes_per_sector as u32,
            sectors_per_cluster: self.sectors_per_cluster as u32,
            total_sectors: self.total_sectors,
            mft_start_cluster: self.mft_cluster_number,
            mft_record_size: self.bytes_per_mft_record(),
        }
    }
}

// ============================================================================
// Volume Accessor
// ============================================================================

/// Read-only raw access to one volume for the duration of a scan.
///
/// Seek+read on a shared handle is not reentrant, so the file sits
/// behind a mutex; the scan pipeline is sequential and never contends.
#[derive(Debug)]
pub struct VolumeAccessor {
    file: Mutex<File>,
    geometry: VolumeGeometry,
    path: String,
}

impl VolumeAccessor {
    /// Open a volume read-only and validate its boot sector.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let volume_path = path.as_ref().display().to_string();
        let mut file =
            File::open(path.as_ref()).map_err(|e| Self::map_open_error(e, &volume_path))?;

        let mut boot = [0u8; 512];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut boot)
            .map_err(|_| MftScanError::NotNtfs(volume_path.clone()))?;

        let boot_sector = NtfsBootSector::from_bytes(&boot)
            .filter(NtfsBootSector::is_valid_ntfs)
            .ok_or_else(|| MftScanError::NotNtfs(volume_path.clone()))?;

        let geometry = boot_sector.geometry();
        info!(
            volume = %volume_path,
            bytes_per_sector = geometry.bytes_per_sector,
            bytes_per_cluster = geometry.bytes_per_cluster(),
            mft_start_cluster = geometry.mft_start_cluster,
            mft_record_size = geometry.mft_record_size,
            serial = format_args!("{:016X}", boot_sector.volume_serial_number),
            "opened NTFS volume"
        );

        Ok(Self {
            file: Mutex::new(file),
            geometry,
            path: volume_path,
        })
    }

    fn map_open_error(e: std::io::Error, path: &str) -> MftScanError {
        match e.kind() {
            ErrorKind::PermissionDenied => MftScanError::AccessDenied(path.to_string()),
            // EBUSY / sharing violation: another process holds the device.
            _ if e.raw_os_error() == Some(16) || e.raw_os_error() == Some(32) => {
                MftScanError::DeviceBusy(path.to_string())
            }
            _ => MftScanError::Io(e),
        }
    }

    pub fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read an exact byte range. Raw device reads must be sector
    /// aligned; callers round their ranges accordingly.
    pub fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> Result<()> {
        let sector = self.geometry.bytes_per_sector as u64;
        if byte_offset % sector != 0 || buf.len() as u64 % sector != 0 {
            return Err(MftScanError::UnalignedRead {
                offset: byte_offset,
                length: buf.len(),
                sector_size: self.geometry.bytes_per_sector,
            });
        }

        debug!(offset = byte_offset, length = buf.len(), "volume read");
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}
