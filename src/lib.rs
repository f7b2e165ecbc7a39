//! A paravirtualized block device stack in two halves: a blkif-style
//! shared-ring transport between a driver domain and a serving backend,
//! and a VHD (fixed/dynamic/differencing) image engine the backend serves
//! sectors from.

#[macro_use]
extern crate num_derive;

mod error;
pub use error::VbdError;
pub type Result<T> = std::result::Result<T, VbdError>;

pub use uuid::Uuid;

pub mod codec;

mod geometry;
pub use geometry::*;

pub mod ring;

pub mod blkproto;

pub mod backend;

pub mod vhd;

pub mod sizes {
    pub const SECTOR: u32 = 512;
    pub const SECTOR_U64: u64 = SECTOR as u64;
    pub const SECTOR_SHIFT: u32 = 9;
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * KIB;
    pub const GIB: u64 = 1024 * MIB;
    pub const PAGE: usize = 4096;
    /// Sectors carried by one shared page.
    pub const SECTORS_PER_PAGE: u8 = (PAGE / SECTOR as usize) as u8;
}

/* Layout of a dynamic disk:
 *
 * +-------------------------------------------------+
 * | Mirror image of the footer (512 bytes)          |
 * +-------------------------------------------------+
 * | Sparse drive header (1024 bytes)                |
 * +-------------------------------------------------+
 * | BAT (Block allocation table)                    |
 * |   - Array of absolute sector offsets into the   |
 * |     file (u32, big-endian).                     |
 * |   - Unused entries are marked as 0xFFFFFFFF     |
 * |   - max entries in h_max_table_entries          |
 * +-------------------------------------------------+
 * | Parent locator data (differencing disks only)   |
 * +-------------------------------------------------+
 * | Data Block 0                                    |
 * | Bitmap (padded to 512 byte sector boundary)     |
 * |   - each bit indicates whether the associated   |
 * |     sector within this block is used.           |
 * | Data                                            |
 * |   - power-of-two multiple of sectors.           |
 * |   - default 2MB (4096 * 512)                    |
 * +-------------------------------------------------+
 * | ...                                             |
 * +-------------------------------------------------+
 * | Data Block n                                    |
 * +-------------------------------------------------+
 * | Footer (512 bytes)                              |
 * +-------------------------------------------------+
 */
