use crate::codec::{self, Endian};
use crate::{sizes, Result, Uuid, VbdError};

use super::checksum_over;

pub const HEADER_SIZE: usize = 1024;

/// "cxsparse"
const DD_COOKIE: &[u8; 8] = b"cxsparse";
/// The header's own data-offset field is unused and carries all-ones.
const DD_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const DD_VERSION: u32 = 0x0001_0000;
/// Default blocksize is 2 meg.
pub const BLOCK_SIZE_DEFAULT: u32 = 0x0020_0000;

const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;
const NAME_FIELD: std::ops::Range<usize> = 64..576;
const LOCATORS_OFFSET: usize = 576;

pub const PLAT_CODE_NONE: u32 = 0x0000_0000;
/// Mac OS X alias ('MacX'): a file:// URI, the code parent resolution scans
/// for.
pub const PLAT_CODE_MACX: u32 = 0x4D61_6358;
/// Windows relative path, UTF-16 ('W2ru')
pub const PLAT_CODE_W2RU: u32 = 0x5732_7275;
/// Windows absolute path, UTF-16 ('W2ku')
pub const PLAT_CODE_W2KU: u32 = 0x5732_6B75;

/// One of the eight 24-byte parent locator entries, together with the
/// payload bytes it points at elsewhere in the file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParentLocator {
    pub platform_code: u32,
    /// Space reserved for the payload, exactly as stored. Values below 512
    /// count sectors rather than bytes (a known spec deviation among
    /// producers); marshalling re-emits this stored value.
    pub data_space: u32,
    /// Actual payload length in bytes.
    pub data_length: u32,
    /// Absolute byte offset of the payload.
    pub data_offset: u64,
    /// Payload, read separately from `data_offset`.
    pub data: Vec<u8>,
}

impl ParentLocator {
    /// `data_space` normalized to bytes.
    pub fn data_space_bytes(&self) -> u32 {
        if self.data_space < sizes::SECTOR {
            self.data_space * sizes::SECTOR
        } else {
            self.data_space
        }
    }

    pub fn platform_code_str(&self) -> String {
        String::from_utf8_lossy(&self.platform_code.to_be_bytes()).into_owned()
    }

    fn parse(buf: &[u8], off: usize) -> Self {
        let (platform_code, _) = codec::read_u32(buf, off, Endian::Big);
        let (data_space, _) = codec::read_u32(buf, off + 4, Endian::Big);
        let (data_length, _) = codec::read_u32(buf, off + 8, Endian::Big);
        let (data_offset, _) = codec::read_u64(buf, off + 16, Endian::Big);
        ParentLocator {
            platform_code,
            data_space,
            data_length,
            data_offset,
            data: Vec::new(),
        }
    }

    fn marshal_into(&self, buf: &mut [u8], off: usize) {
        codec::put_u32(buf, off, self.platform_code, Endian::Big);
        codec::put_u32(buf, off + 4, self.data_space, Endian::Big);
        codec::put_u32(buf, off + 8, self.data_length, Endian::Big);
        // [off+12..off+16] reserved
        codec::put_u64(buf, off + 16, self.data_offset, Endian::Big);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub data_offset: u64,
    /// Absolute byte offset of the BAT.
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    /// As stored on disk; refreshed by `marshal`.
    pub checksum: u32,
    pub parent_uid: Uuid,
    pub parent_time_stamp: u32,
    /// Parent unicode name, raw 512-byte UTF-16 field (big-endian unless a
    /// BOM says otherwise), kept verbatim for exact round-trips.
    parent_name_raw: [u8; 512],
    pub locators: [ParentLocator; 8],
}

impl Header {
    pub fn new(capacity: u64, table_offset: u64, block_size: u32) -> Self {
        Header {
            data_offset: DD_OFFSET,
            table_offset,
            header_version: DD_VERSION,
            max_table_entries: ((capacity + block_size as u64 - 1) / block_size as u64) as u32,
            block_size,
            checksum: 0,
            parent_uid: Uuid::nil(),
            parent_time_stamp: 0,
            parent_name_raw: [0_u8; 512],
            locators: Default::default(),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(VbdError::FileTooSmall);
        }
        if &buf[0..8] != DD_COOKIE {
            return Err(VbdError::InvalidSparseHeaderCookie);
        }

        let (data_offset, _) = codec::read_u64(buf, 8, Endian::Big);
        let (table_offset, _) = codec::read_u64(buf, 16, Endian::Big);
        let (header_version, _) = codec::read_u32(buf, 24, Endian::Big);
        let (max_table_entries, _) = codec::read_u32(buf, 28, Endian::Big);
        let (block_size, _) = codec::read_u32(buf, 32, Endian::Big);
        let (checksum, _) = codec::read_u32(buf, 36, Endian::Big);
        let (parent_time_stamp, _) = codec::read_u32(buf, 56, Endian::Big);

        let computed = checksum_over(&buf[..HEADER_SIZE], CHECKSUM_FIELD);
        if computed != checksum {
            log::warn!(
                "sparse header checksum mismatch: stored {:#010x}, computed {:#010x}",
                checksum,
                computed
            );
        }

        let mut locators: [ParentLocator; 8] = Default::default();
        for (i, loc) in locators.iter_mut().enumerate() {
            *loc = ParentLocator::parse(buf, LOCATORS_OFFSET + i * 24);
        }

        Ok(Header {
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            parent_uid: Uuid::from_bytes(buf[40..56].try_into().unwrap()),
            parent_time_stamp,
            parent_name_raw: buf[NAME_FIELD].try_into().unwrap(),
            locators,
        })
    }

    /// The 1024-byte on-disk form, checksum recomputed.
    pub fn marshal(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0_u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(DD_COOKIE);
        codec::put_u64(&mut buf, 8, self.data_offset, Endian::Big);
        codec::put_u64(&mut buf, 16, self.table_offset, Endian::Big);
        codec::put_u32(&mut buf, 24, self.header_version, Endian::Big);
        codec::put_u32(&mut buf, 28, self.max_table_entries, Endian::Big);
        codec::put_u32(&mut buf, 32, self.block_size, Endian::Big);
        buf[40..56].copy_from_slice(self.parent_uid.as_bytes());
        codec::put_u32(&mut buf, 56, self.parent_time_stamp, Endian::Big);
        buf[NAME_FIELD].copy_from_slice(&self.parent_name_raw);
        for (i, loc) in self.locators.iter().enumerate() {
            loc.marshal_into(&mut buf, LOCATORS_OFFSET + i * 24);
        }
        let checksum = checksum_over(&buf, CHECKSUM_FIELD);
        codec::put_u32(&mut buf, 36, checksum, Endian::Big);
        buf
    }

    /// The parent's file name, decoded from the UTF-16 name field.
    pub fn parent_name(&self) -> Result<String> {
        let mut end = self.parent_name_raw.len();
        while end >= 2 && self.parent_name_raw[end - 2..end] == [0, 0] {
            end -= 2;
        }
        codec::utf16_to_string(&self.parent_name_raw[..end])
    }

    pub fn set_parent_name(&mut self, name: &str) {
        let cps: Vec<u32> = name.chars().map(|c| c as u32).collect();
        let bytes = codec::encode_utf16(&cps, Endian::Big);
        codec::put_padded(&mut self.parent_name_raw, 0, &bytes, 512);
    }

    pub fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / sizes::SECTOR_U64
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "VHD Header Summary:")?;
        writeln!(f, "-------------------")?;
        writeln!(f, "{:<20}: {:#018X}", "Data offset (unused)", self.data_offset)?;
        writeln!(f, "{:<20}: {:#018X}", "Table offset", self.table_offset)?;
        writeln!(
            f,
            "{:<20}: Major: {}, Minor: {}",
            "Header version",
            self.header_version >> 16,
            self.header_version & 0xFFFF
        )?;
        writeln!(f, "{:<20}: {}", "Max BAT size", self.max_table_entries)?;
        writeln!(
            f,
            "{:<20}: {} Mb ({} bytes)",
            "Block size",
            self.block_size >> 20,
            self.block_size
        )?;
        writeln!(
            f,
            "{:<20}: {}",
            "Parent name",
            self.parent_name().unwrap_or_default()
        )?;
        writeln!(f, "{:<20}: {}", "Parent UUID", self.parent_uid)?;
        writeln!(f, "{:<20}: {:#010X}", "Parent timestamp", self.parent_time_stamp)?;
        writeln!(f, "{:<20}: {:#010X}", "Checksum", self.checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_name_and_locators() {
        let mut header = Header::new(8 * sizes::MIB, 2048, BLOCK_SIZE_DEFAULT);
        header.parent_uid = Uuid::new_v4();
        header.parent_time_stamp = 0x0102_0304;
        header.set_parent_name("parent.vhd");
        header.locators[0] = ParentLocator {
            platform_code: PLAT_CODE_MACX,
            data_space: 512,
            data_length: 20,
            data_offset: 1536,
            data: Vec::new(),
        };

        let bytes = header.marshal();
        let mut expected = header.clone();
        expected.checksum = codec::read_u32(&bytes, 36, Endian::Big).0;
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.marshal(), bytes);
        assert_eq!(parsed.parent_name().unwrap(), "parent.vhd");
    }

    #[test]
    fn bad_cookie_rejected() {
        let header = Header::new(sizes::MIB, 2048, BLOCK_SIZE_DEFAULT);
        let mut bytes = header.marshal();
        bytes[0] = b'y';
        assert!(matches!(
            Header::parse(&bytes),
            Err(VbdError::InvalidSparseHeaderCookie)
        ));
    }

    #[test]
    fn locator_space_normalization() {
        // below 512 the stored value counts sectors
        let loc = ParentLocator { data_space: 1, ..Default::default() };
        assert_eq!(loc.data_space_bytes(), 512);
        let loc = ParentLocator { data_space: 512, ..Default::default() };
        assert_eq!(loc.data_space_bytes(), 512);
        let loc = ParentLocator { data_space: 4096, ..Default::default() };
        assert_eq!(loc.data_space_bytes(), 4096);
    }

    #[test]
    fn max_table_entries_rounds_up() {
        let header = Header::new(3 * sizes::MIB, 2048, BLOCK_SIZE_DEFAULT);
        assert_eq!(header.max_table_entries, 2);
    }
}
