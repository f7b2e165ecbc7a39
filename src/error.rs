use thiserror::Error;

#[derive(Debug, Error)]
pub enum VbdError {
    #[error("Read beyond end of disk: sector {0}")]
    ReadBeyondEOD(u64),
    #[error("Write beyond end of disk: sector {0}")]
    WriteBeyondEOD(u64),

    #[error("File too small for a VHD image")]
    FileTooSmall,
    #[error("Invalid VHD footer cookie")]
    InvalidFooterCookie,
    #[error("Invalid VHD sparse header cookie")]
    InvalidSparseHeaderCookie,
    #[error("Invalid VHD sparse header BAT offset")]
    InvalidSparseHeaderOffset,
    #[error("Unknown VHD disk type '{0}'")]
    UnknownDiskKind(u32),
    #[error("Disk size too big for VHD")]
    DiskSizeTooBig,
    #[error("Invalid block index '{0}'")]
    InvalidBlockIndex(usize),

    #[error("No usable parent locator for differencing disk")]
    ParentNotFound,
    #[error("Differencing parent must be dynamic or differencing")]
    ParentNotDynamic,

    #[error("Invalid UTF-16: unpaired surrogate at unit {0}")]
    UnpairedSurrogate(usize),
    #[error("Invalid UTF-16: odd byte length {0}")]
    OddUtf16Length(usize),

    #[error("Malformed request slot: {0}")]
    Protocol(&'static str),
    #[error("Segment count {0} out of range 1..=11")]
    SegmentCount(u8),

    #[error("On-disk regions overlap: {0}")]
    Overlap(crate::vhd::check::OverlapReport),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}
