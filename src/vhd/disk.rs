use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::{sizes, Result, Uuid, VbdError};

use super::{
    bitmap_size_padded, vhd_time_of, Bat, DiskKind, Footer, Header, ParentLocator,
    BAT_UNUSED, BLOCK_SIZE_DEFAULT, DEFAULT_LOCATOR_OFFSET, DEFAULT_TABLE_OFFSET,
    FOOTER_SIZE, HEADER_SIZE, PLAT_CODE_MACX,
};

/// Tunables for `create_new_*`; the defaults mirror what every mainstream
/// producer writes.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub block_size: u32,
    pub table_offset: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            block_size: BLOCK_SIZE_DEFAULT,
            table_offset: DEFAULT_TABLE_OFFSET,
        }
    }
}

/// Type-specific on-disk shape behind the footer.
#[derive(Debug)]
enum Extent {
    /// Footer copy, raw data, trailing footer.
    Fixed,
    /// Footer copy, sparse header, BAT, data blocks, trailing footer.
    Sparse { header: Header, bat: Bat },
}

/// An open VHD image: the memory map is the sole mutation path, and the
/// parent chain of a differencing disk is owned recursively.
#[derive(Debug)]
pub struct Vhd {
    path: PathBuf,
    file: File,
    map: MmapMut,
    footer: Footer,
    extent: Extent,
    parent: Option<Box<Vhd>>,
}

/// Where a logical sector lands inside its block.
struct SectorAddr {
    block: usize,
    sec_in_block: u64,
    bitmap_byte: u64,
    mask: u8,
}

impl SectorAddr {
    fn of(sector: u64, sectors_per_block: u64) -> Self {
        let sec_in_block = sector % sectors_per_block;
        SectorAddr {
            block: (sector / sectors_per_block) as usize,
            sec_in_block,
            bitmap_byte: sec_in_block / 8,
            mask: 0x80 >> (sec_in_block % 8),
        }
    }
}

impl Drop for Vhd {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush() {
            log::debug!("flush of {} on drop failed: {}", self.path.display(), e);
        }
    }
}

impl Vhd {
    /// Opens an image read/write, walking the parent chain of a
    /// differencing disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (FOOTER_SIZE + HEADER_SIZE) as u64 {
            return Err(VbdError::FileTooSmall);
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        let footer = Footer::parse(&map[..FOOTER_SIZE])?;

        let extent = match footer.disk_kind {
            DiskKind::Fixed => {
                if file_size < footer.current_size + 2 * FOOTER_SIZE as u64 {
                    return Err(VbdError::FileTooSmall);
                }
                Extent::Fixed
            }
            DiskKind::Dynamic | DiskKind::Differencing => {
                if footer.data_offset.saturating_add(HEADER_SIZE as u64) > file_size {
                    return Err(VbdError::InvalidSparseHeaderOffset);
                }
                let hdr_off = footer.data_offset as usize;
                let mut header = Header::parse(&map[hdr_off..hdr_off + HEADER_SIZE])?;

                let bat_end = header.table_offset + header.max_table_entries as u64 * 4;
                if header.table_offset >= file_size || bat_end > file_size {
                    return Err(VbdError::InvalidSparseHeaderOffset);
                }
                let bat = Bat::parse(
                    &map[header.table_offset as usize..bat_end as usize],
                    header.max_table_entries,
                );

                load_locator_data(&mut header, &map, file_size);
                Extent::Sparse { header, bat }
            }
            DiskKind::None => return Err(VbdError::UnknownDiskKind(0)),
        };

        let parent = match (&footer.disk_kind, &extent) {
            (DiskKind::Differencing, Extent::Sparse { header, .. }) => {
                Some(Box::new(resolve_parent(&path, header)?))
            }
            _ => None,
        };

        Ok(Vhd { path, file, map, footer, extent, parent })
    }

    pub fn create_new_fixed<P: AsRef<Path>>(path: P, size: u64, uid: Uuid) -> Result<Self> {
        let size = round_up(size, sizes::SECTOR_U64);
        check_max_size(size)?;
        let footer = Footer::new(size, DiskKind::Fixed, uid);

        // footer copy | data | trailing footer
        let trailing = FOOTER_SIZE as u64 + size;
        let (file, mut map) = create_mapped(path.as_ref(), trailing + FOOTER_SIZE as u64)?;
        let bytes = footer.marshal();
        map[..FOOTER_SIZE].copy_from_slice(&bytes);
        map[trailing as usize..trailing as usize + FOOTER_SIZE].copy_from_slice(&bytes);
        map.flush()?;

        Ok(Vhd {
            path: path.as_ref().to_path_buf(),
            file,
            map,
            footer,
            extent: Extent::Fixed,
            parent: None,
        })
    }

    pub fn create_new_dynamic<P: AsRef<Path>>(
        path: P,
        requested_size: u64,
        uid: Uuid,
        options: CreateOptions,
    ) -> Result<Self> {
        let size = round_up(requested_size, options.block_size as u64);
        check_max_size(size)?;

        let footer = Footer::new(size, DiskKind::Dynamic, uid);
        let header = Header::new(size, options.table_offset, options.block_size);
        let bat = Bat::new(header.max_table_entries);

        let vhd = write_sparse_image(path.as_ref(), footer, header, bat, None)?;
        Ok(vhd)
    }

    pub fn create_new_difference<P: AsRef<Path>>(
        path: P,
        parent_path: P,
        uid: Uuid,
        options: CreateOptions,
    ) -> Result<Self> {
        let parent_path = parent_path.as_ref();
        let parent = Vhd::load(parent_path)?;
        let parent_header = match &parent.extent {
            Extent::Sparse { header, .. } => header,
            Extent::Fixed => return Err(VbdError::ParentNotDynamic),
        };

        let size = parent.footer.current_size;
        let mut footer = Footer::new(size, DiskKind::Differencing, uid);
        footer.geometry = parent.footer.geometry;

        let basename = parent_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut header = Header::new(size, options.table_offset, parent_header.block_size);
        header.max_table_entries = parent_header.max_table_entries;
        header.parent_uid = parent.footer.uid;
        header.parent_time_stamp = vhd_time_of(std::fs::metadata(parent_path)?.modified()?);
        header.set_parent_name(&basename);
        header.locators[0] = ParentLocator {
            platform_code: PLAT_CODE_MACX,
            data_space: sizes::SECTOR,
            data_length: 0, // filled below once the payload is built
            data_offset: DEFAULT_LOCATOR_OFFSET,
            data: format!("file://./{}", basename).into_bytes(),
        };
        header.locators[0].data_length = header.locators[0].data.len() as u32;

        let bat = Bat::new(header.max_table_entries);
        write_sparse_image(path.as_ref(), footer, header, bat, Some(Box::new(parent)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> Option<&Header> {
        match &self.extent {
            Extent::Sparse { header, .. } => Some(header),
            Extent::Fixed => None,
        }
    }

    pub fn bat(&self) -> Option<&Bat> {
        match &self.extent {
            Extent::Sparse { bat, .. } => Some(bat),
            Extent::Fixed => None,
        }
    }

    pub fn parent(&self) -> Option<&Vhd> {
        self.parent.as_deref()
    }

    pub fn disk_kind(&self) -> DiskKind {
        self.footer.disk_kind
    }

    pub fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Reads one 512-byte sector, falling back to the parent chain or to
    /// zeros where the sector has never been written.
    pub fn read_sector(&self, sector: u64) -> Result<[u8; sizes::SECTOR as usize]> {
        if sector * sizes::SECTOR_U64 >= self.footer.current_size {
            return Err(VbdError::ReadBeyondEOD(sector));
        }

        let (header, bat) = match &self.extent {
            Extent::Fixed => {
                let off = (FOOTER_SIZE as u64 + sector * sizes::SECTOR_U64) as usize;
                return Ok(self.map[off..off + sizes::SECTOR as usize].try_into().unwrap());
            }
            Extent::Sparse { header, bat } => (header, bat),
        };

        let addr = SectorAddr::of(sector, header.sectors_per_block());
        let entry = bat.get(addr.block)?;
        if entry == BAT_UNUSED {
            return match (&self.footer.disk_kind, &self.parent) {
                (DiskKind::Differencing, Some(parent)) => parent.read_sector(sector),
                _ => Ok([0_u8; sizes::SECTOR as usize]),
            };
        }

        let block_start = entry as u64 * sizes::SECTOR_U64;
        self.check_block_bounds(addr.block, block_start, header.block_size)?;
        // A dynamic disk's bitmap is advisory for reads; a differencing
        // disk's decides between local data and the parent.
        if self.footer.disk_kind == DiskKind::Differencing {
            let bit = self.map[(block_start + addr.bitmap_byte) as usize] & addr.mask;
            if bit == 0 {
                if let Some(parent) = &self.parent {
                    return parent.read_sector(sector);
                }
                return Ok([0_u8; sizes::SECTOR as usize]);
            }
        }

        let data_start = block_start + bitmap_size_padded(header.block_size);
        let off = (data_start + addr.sec_in_block * sizes::SECTOR_U64) as usize;
        Ok(self.map[off..off + sizes::SECTOR as usize].try_into().unwrap())
    }

    /// Writes one 512-byte sector, allocating its block on first touch.
    pub fn write_sector(&mut self, sector: u64, data: &[u8; sizes::SECTOR as usize]) -> Result<()> {
        if sector * sizes::SECTOR_U64 >= self.footer.current_size {
            return Err(VbdError::WriteBeyondEOD(sector));
        }

        let (header, bat) = match &self.extent {
            Extent::Fixed => {
                let off = (FOOTER_SIZE as u64 + sector * sizes::SECTOR_U64) as usize;
                self.map[off..off + sizes::SECTOR as usize].copy_from_slice(data);
                return Ok(());
            }
            Extent::Sparse { header, bat } => (header, bat),
        };

        let addr = SectorAddr::of(sector, header.sectors_per_block());
        let mut entry = bat.get(addr.block)?;
        if entry == BAT_UNUSED {
            entry = self.allocate_block(addr.block)?;
        }

        let block_start = entry as u64 * sizes::SECTOR_U64;
        let (bitmap_size, block_size) = match &self.extent {
            Extent::Sparse { header, .. } => {
                (bitmap_size_padded(header.block_size), header.block_size)
            }
            Extent::Fixed => unreachable!(),
        };
        self.check_block_bounds(addr.block, block_start, block_size)?;
        let off = (block_start + bitmap_size + addr.sec_in_block * sizes::SECTOR_U64) as usize;
        self.map[off..off + sizes::SECTOR as usize].copy_from_slice(data);
        self.map[(block_start + addr.bitmap_byte) as usize] |= addr.mask;
        Ok(())
    }

    /// A corrupt BAT can point a block outside the file; refuse rather
    /// than index past the map.
    fn check_block_bounds(&self, block: usize, block_start: u64, block_size: u32) -> Result<()> {
        let end = block_start + bitmap_size_padded(block_size) + block_size as u64;
        if end > self.map.len() as u64 {
            return Err(VbdError::InvalidBlockIndex(block));
        }
        Ok(())
    }

    /// First byte past everything the image currently uses, excluding the
    /// trailing footer.
    pub fn top_unused_offset(&self) -> u64 {
        match &self.extent {
            Extent::Fixed => FOOTER_SIZE as u64 + self.footer.current_size,
            Extent::Sparse { header, bat } => {
                let mut top = header.table_offset + header.max_table_entries as u64 * 4;
                for loc in &header.locators {
                    if loc.platform_code != super::PLAT_CODE_NONE {
                        top = top.max(loc.data_offset + loc.data_space_bytes() as u64);
                    }
                }
                let per_block =
                    header.block_size as u64 + bitmap_size_padded(header.block_size);
                for (_, sector) in bat.allocated() {
                    top = top.max(sector as u64 * sizes::SECTOR_U64 + per_block);
                }
                top
            }
        }
    }

    /// Grows the file by one block (bitmap + data, zero-filled), updates
    /// the BAT, and re-seats the trailing footer past the new block.
    fn allocate_block(&mut self, block: usize) -> Result<u32> {
        let place = (self.top_unused_offset() + sizes::SECTOR_U64 - 1) / sizes::SECTOR_U64;
        let block_start = place * sizes::SECTOR_U64;

        let (table_offset, bat_bytes, block_bytes) = match &self.extent {
            Extent::Sparse { header, bat } => (
                header.table_offset,
                bat.byte_len(),
                header.block_size as u64 + bitmap_size_padded(header.block_size),
            ),
            Extent::Fixed => return Err(VbdError::InvalidBlockIndex(block)),
        };

        let trailing = block_start + block_bytes;
        self.file.set_len(trailing + FOOTER_SIZE as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.map[block_start as usize..trailing as usize].fill(0);

        let bat = match &mut self.extent {
            Extent::Sparse { bat, .. } => bat,
            Extent::Fixed => unreachable!(),
        };
        bat.set(block, place as u32)?;
        bat.marshal_into(
            &mut self.map[table_offset as usize..table_offset as usize + bat_bytes],
        );
        let footer_bytes = self.footer.marshal();
        self.map[trailing as usize..trailing as usize + FOOTER_SIZE]
            .copy_from_slice(&footer_bytes);
        Ok(place as u32)
    }
}

const MAX_VHD_SIZE: u64 = 2040 * sizes::GIB;

fn check_max_size(size: u64) -> Result<()> {
    if size > MAX_VHD_SIZE {
        return Err(VbdError::DiskSizeTooBig);
    }
    Ok(())
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn create_mapped(path: &Path, len: u64) -> Result<(File, MmapMut)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok((file, map))
}

/// Lays down footer copy | header | (locator payloads) | BAT | trailing
/// footer for a fresh sparse image.
fn write_sparse_image(
    path: &Path,
    footer: Footer,
    header: Header,
    bat: Bat,
    parent: Option<Box<Vhd>>,
) -> Result<Vhd> {
    let trailing = header.table_offset + bat.byte_len() as u64;
    let (file, mut map) = create_mapped(path, trailing + FOOTER_SIZE as u64)?;

    let footer_bytes = footer.marshal();
    map[..FOOTER_SIZE].copy_from_slice(&footer_bytes);

    let hdr_off = footer.data_offset as usize;
    map[hdr_off..hdr_off + HEADER_SIZE].copy_from_slice(&header.marshal());

    for loc in &header.locators {
        if loc.platform_code != super::PLAT_CODE_NONE && !loc.data.is_empty() {
            let off = loc.data_offset as usize;
            map[off..off + loc.data.len()].copy_from_slice(&loc.data);
        }
    }

    bat.marshal_into(
        &mut map[header.table_offset as usize..header.table_offset as usize + bat.byte_len()],
    );
    map[trailing as usize..trailing as usize + FOOTER_SIZE].copy_from_slice(&footer_bytes);
    map.flush()?;

    Ok(Vhd {
        path: path.to_path_buf(),
        file,
        map,
        footer,
        extent: Extent::Sparse { header, bat },
        parent,
    })
}

fn load_locator_data(header: &mut Header, map: &MmapMut, file_size: u64) {
    for loc in header.locators.iter_mut() {
        if loc.platform_code == super::PLAT_CODE_NONE || loc.data_length == 0 {
            continue;
        }
        let end = loc.data_offset + loc.data_length as u64;
        if end > file_size {
            log::warn!(
                "parent locator {} payload [{:#x}, {:#x}) lies outside the file",
                loc.platform_code_str(),
                loc.data_offset,
                end
            );
            continue;
        }
        loc.data = map[loc.data_offset as usize..end as usize].to_vec();
    }
}

/// Scans MacX locators for a `file://` URI naming an existing file and
/// loads it; relative URIs resolve against the child's directory.
fn resolve_parent(child: &Path, header: &Header) -> Result<Vhd> {
    for loc in &header.locators {
        if loc.platform_code != PLAT_CODE_MACX {
            continue;
        }
        let text = String::from_utf8_lossy(&loc.data);
        let text = text.trim_end_matches('\0');
        let Some(rest) = text.strip_prefix("file://") else {
            continue;
        };
        let candidate = if Path::new(rest).is_absolute() {
            PathBuf::from(rest)
        } else {
            child.parent().unwrap_or(Path::new(".")).join(rest)
        };
        if candidate.exists() {
            return Vhd::load(candidate);
        }
        log::warn!("parent locator names missing file {}", candidate.display());
    }
    Err(VbdError::ParentNotFound)
}
