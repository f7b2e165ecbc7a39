//! Sanity validation of an image's on-disk layout: every metadata region
//! and allocated block must occupy a disjoint byte range.

use crate::{sizes, Result, VbdError};

use super::{bitmap_size_padded, Vhd, FOOTER_SIZE, HEADER_SIZE, PLAT_CODE_NONE};

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub name: String,
    pub start: u64,
    pub length: u64,
}

impl Region {
    fn new(name: impl Into<String>, start: u64, length: u64) -> Self {
        Region { name: name.into(), start, length }
    }

    fn end(&self) -> u64 {
        self.start + self.length
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{:#x}, {:#x})", self.name, self.start, self.end())
    }
}

/// Every colliding pair found by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapReport(pub Vec<(Region, Region)>);

impl std::fmt::Display for OverlapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (a, b)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} overlaps {}", a, b)?;
        }
        Ok(())
    }
}

/// The image's used regions, sorted by start offset.
pub fn regions(vhd: &Vhd) -> Vec<Region> {
    let mut out = vec![Region::new("footer copy", 0, FOOTER_SIZE as u64)];

    if let Some(header) = vhd.header() {
        out.push(Region::new(
            "sparse header",
            vhd.footer().data_offset,
            HEADER_SIZE as u64,
        ));
        for (i, loc) in header.locators.iter().enumerate() {
            if loc.platform_code != PLAT_CODE_NONE {
                out.push(Region::new(
                    format!("locator {} payload", i),
                    loc.data_offset,
                    loc.data_space_bytes() as u64,
                ));
            }
        }
        out.push(Region::new(
            "BAT",
            header.table_offset,
            header.max_table_entries as u64 * 4,
        ));
        if let Some(bat) = vhd.bat() {
            let per_block = header.block_size as u64 + bitmap_size_padded(header.block_size);
            for (i, sector) in bat.allocated() {
                out.push(Region::new(
                    format!("block {}", i),
                    sector as u64 * sizes::SECTOR_U64,
                    per_block,
                ));
            }
        }
    }

    out.sort_by_key(|r| r.start);
    out
}

/// Checks that no two used regions intersect; never mutates the image.
pub fn check(vhd: &Vhd) -> Result<()> {
    match scan(regions(vhd)) {
        None => Ok(()),
        Some(report) => Err(VbdError::Overlap(report)),
    }
}

/// A single pass over start-sorted regions: each region must begin at or
/// past the furthest end seen so far.
fn scan(regions: Vec<Region>) -> Option<OverlapReport> {
    let mut collisions = Vec::new();
    let mut open: Option<&Region> = None;
    for region in &regions {
        if let Some(prev) = open {
            if region.start < prev.end() {
                collisions.push((prev.clone(), region.clone()));
            }
        }
        if open.map_or(true, |prev| region.end() > prev.end()) {
            open = Some(region);
        }
    }
    if collisions.is_empty() {
        None
    } else {
        Some(OverlapReport(collisions))
    }
}
