use bitflags::bitflags;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::codec::{self, Endian};
use crate::{sizes, Chs, Result, Uuid, VbdError};

use super::{checksum_over, vhd_time, DiskKind, DEFAULT_HEADER_OFFSET};

pub const FOOTER_SIZE: usize = 512;

/// "conectix"
const HD_COOKIE: &[u8; 8] = b"conectix";
const HD_FF_VERSION: u32 = 0x0001_0000;

const HD_CR_APP: &[u8; 4] = b"rvbd";
const HD_CR_VERSION: u32 = 0x0001_0000;
/// (Wi2k)
const HD_CR_OS_WINDOWS: &[u8; 4] = b"Wi2k";

const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;

bitflags! {
    /// Feature bits in the footer. Bit positions, not enumerator values:
    /// a disk with no features set carries 0.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Features: u32 {
        const TEMPORARY = 1 << 0;
        const RESERVED = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Footer {
    pub features: Features,
    pub format_version: u32,
    /// Absolute offset of the sparse header; `0xFFFF_FFFF_FFFF_FFFF` for
    /// fixed disks.
    pub data_offset: u64,
    /// Creation time, seconds since the VHD epoch.
    pub time_stamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Chs,
    pub disk_kind: DiskKind,
    /// As stored on disk; refreshed by `marshal`.
    pub checksum: u32,
    pub uid: Uuid,
    pub saved_state: u8,
}

impl Footer {
    pub fn new(size: u64, disk_kind: DiskKind, uid: Uuid) -> Self {
        let data_offset = match disk_kind {
            DiskKind::Fixed => u64::MAX,
            _ => DEFAULT_HEADER_OFFSET,
        };

        let mut footer = Footer {
            features: Features::RESERVED,
            format_version: HD_FF_VERSION,
            data_offset,
            time_stamp: vhd_time(),
            creator_app: *HD_CR_APP,
            creator_version: HD_CR_VERSION,
            creator_host_os: *HD_CR_OS_WINDOWS,
            original_size: size,
            current_size: size,
            geometry: Chs::from_capacity(size),
            disk_kind,
            checksum: 0,
            uid,
            saved_state: 0,
        };
        footer.checksum = checksum_over(&footer.to_bytes(), CHECKSUM_FIELD);
        footer
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(VbdError::FileTooSmall);
        }
        if &buf[0..8] != HD_COOKIE {
            return Err(VbdError::InvalidFooterCookie);
        }

        let (features, _) = codec::read_u32(buf, 8, Endian::Big);
        let (format_version, _) = codec::read_u32(buf, 12, Endian::Big);
        let (data_offset, _) = codec::read_u64(buf, 16, Endian::Big);
        let (time_stamp, _) = codec::read_u32(buf, 24, Endian::Big);
        let (creator_version, _) = codec::read_u32(buf, 32, Endian::Big);
        let (original_size, _) = codec::read_u64(buf, 40, Endian::Big);
        let (current_size, _) = codec::read_u64(buf, 48, Endian::Big);
        let (cylinders, _) = codec::read_u16(buf, 56, Endian::Big);
        let (disk_type, _) = codec::read_u32(buf, 60, Endian::Big);
        let (checksum, _) = codec::read_u32(buf, 64, Endian::Big);

        let disk_kind =
            DiskKind::from_u32(disk_type).ok_or(VbdError::UnknownDiskKind(disk_type))?;

        let footer = Footer {
            features: Features::from_bits_retain(features),
            format_version,
            data_offset,
            time_stamp,
            creator_app: buf[28..32].try_into().unwrap(),
            creator_version,
            creator_host_os: buf[36..40].try_into().unwrap(),
            original_size,
            current_size,
            geometry: Chs::new(cylinders, buf[58], buf[59]),
            disk_kind,
            checksum,
            uid: Uuid::from_bytes(buf[68..84].try_into().unwrap()),
            saved_state: buf[84],
        };

        // Some producers miscompute the footer checksum; note it and accept.
        let computed = checksum_over(&buf[..FOOTER_SIZE], CHECKSUM_FIELD);
        if computed != checksum {
            log::warn!(
                "footer checksum mismatch: stored {:#010x}, computed {:#010x}",
                checksum,
                computed
            );
        }

        Ok(footer)
    }

    /// The 512-byte on-disk form, checksum recomputed.
    pub fn marshal(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = self.to_bytes();
        let checksum = checksum_over(&buf, CHECKSUM_FIELD);
        codec::put_u32(&mut buf, 64, checksum, Endian::Big);
        buf
    }

    fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0_u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(HD_COOKIE);
        codec::put_u32(&mut buf, 8, self.features.bits(), Endian::Big);
        codec::put_u32(&mut buf, 12, self.format_version, Endian::Big);
        codec::put_u64(&mut buf, 16, self.data_offset, Endian::Big);
        codec::put_u32(&mut buf, 24, self.time_stamp, Endian::Big);
        buf[28..32].copy_from_slice(&self.creator_app);
        codec::put_u32(&mut buf, 32, self.creator_version, Endian::Big);
        buf[36..40].copy_from_slice(&self.creator_host_os);
        codec::put_u64(&mut buf, 40, self.original_size, Endian::Big);
        codec::put_u64(&mut buf, 48, self.current_size, Endian::Big);
        codec::put_u16(&mut buf, 56, self.geometry.cylinders, Endian::Big);
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors_per_track;
        codec::put_u32(&mut buf, 60, self.disk_kind.to_u32().unwrap_or(0), Endian::Big);
        // checksum field left zero here
        buf[68..84].copy_from_slice(self.uid.as_bytes());
        buf[84] = self.saved_state;
        buf
    }

    pub fn capacity_in_sectors(&self) -> u64 {
        self.current_size / sizes::SECTOR_U64
    }
}

impl std::fmt::Display for Footer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "VHD Footer Summary:")?;
        writeln!(f, "-------------------")?;
        writeln!(f, "{:<20}: {:#010X}", "Features", self.features.bits())?;
        writeln!(
            f,
            "{:<20}: Major: {}, Minor: {}",
            "File format version",
            self.format_version >> 16,
            self.format_version & 0xFFFF
        )?;
        writeln!(f, "{:<20}: {:#018X}", "Data offset", self.data_offset)?;
        writeln!(f, "{:<20}: {:#010X}", "Timestamp", self.time_stamp)?;
        writeln!(
            f,
            "{:<20}: {}",
            "Creator application",
            String::from_utf8_lossy(&self.creator_app)
        )?;
        writeln!(
            f,
            "{:<20}: {} Mb ({} bytes)",
            "Original disk size",
            self.original_size >> 20,
            self.original_size
        )?;
        writeln!(
            f,
            "{:<20}: {} Mb ({} bytes)",
            "Current disk size",
            self.current_size >> 20,
            self.current_size
        )?;
        writeln!(f, "{:<20}: {}", "Geometry", self.geometry)?;
        writeln!(f, "{:<20}: {}", "Disk type", self.disk_kind)?;
        writeln!(f, "{:<20}: {:#010X}", "Checksum", self.checksum)?;
        writeln!(f, "{:<20}: {}", "UUID", self.uid)
    }
}
