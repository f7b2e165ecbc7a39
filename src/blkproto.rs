//! Request/response records exchanged over the shared ring, in the two
//! slot layouts the protocol defines (64-bit-aligned and 32-bit-aligned),
//! all little-endian.

use crate::codec::{self, Endian};
use crate::{Result, VbdError};

pub const MAX_SEGMENTS_PER_REQUEST: usize = 11;
const SEGMENT_SIZE: usize = 8;
/// 24-byte fixed part plus 11 segments, padded out to the protocol's
/// 64-bit record size.
pub const REQUEST_SLOT_SIZE_X86_64: usize = 112;
/// The 32-bit layout drops the 4 pad bytes before `id`.
pub const REQUEST_SLOT_SIZE_X86_32: usize = 108;
pub const RESPONSE_SIZE: usize = 12;

const E: Endian = Endian::Little;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlkOp {
    Read,
    Write,
    WriteBarrier,
    Flush,
    Unknown(u8),
}

impl From<u8> for BlkOp {
    fn from(v: u8) -> Self {
        match v {
            0 => BlkOp::Read,
            1 => BlkOp::Write,
            2 => BlkOp::WriteBarrier,
            3 => BlkOp::Flush,
            n => BlkOp::Unknown(n),
        }
    }
}

impl BlkOp {
    pub fn code(self) -> u8 {
        match self {
            BlkOp::Read => 0,
            BlkOp::Write => 1,
            BlkOp::WriteBarrier => 2,
            BlkOp::Flush => 3,
            BlkOp::Unknown(n) => n,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlkStatus {
    Ok,
    NotSupported,
    Error,
    Unknown(u16),
}

impl From<u16> for BlkStatus {
    fn from(v: u16) -> Self {
        match v {
            0 => BlkStatus::Ok,
            0xFFFE => BlkStatus::NotSupported,
            0xFFFF => BlkStatus::Error,
            n => BlkStatus::Unknown(n),
        }
    }
}

impl BlkStatus {
    pub fn code(self) -> u16 {
        match self {
            BlkStatus::Ok => 0,
            BlkStatus::NotSupported => 0xFFFE,
            BlkStatus::Error => 0xFFFF,
            BlkStatus::Unknown(n) => n,
        }
    }
}

/// Which slot layout a ring session uses; fixed at initialization.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Abi {
    X86_32,
    X86_64,
    Native,
}

impl Abi {
    pub fn resolve(self) -> Abi {
        match self {
            Abi::Native => {
                if cfg!(target_pointer_width = "32") {
                    Abi::X86_32
                } else {
                    Abi::X86_64
                }
            }
            other => other,
        }
    }

    pub fn slot_size(self) -> usize {
        match self.resolve() {
            Abi::X86_32 => REQUEST_SLOT_SIZE_X86_32,
            _ => REQUEST_SLOT_SIZE_X86_64,
        }
    }

    /// Byte offset of the `id` field: the 64-bit layout pads to an 8-byte
    /// boundary first.
    fn id_offset(self) -> usize {
        match self.resolve() {
            Abi::X86_32 => 4,
            _ => 8,
        }
    }
}

/// A contiguous sector run within one shared 4 KiB page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Segment {
    pub gref: u32,
    pub first_sector: u8,
    pub last_sector: u8,
}

impl Segment {
    pub fn sector_count(&self) -> u64 {
        (self.last_sector - self.first_sector) as u64 + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: BlkOp,
    pub handle: u16,
    pub id: u64,
    pub sector: u64,
    pub segments: Vec<Segment>,
}

impl Request {
    /// Sectors covered by all segments together.
    pub fn total_sectors(&self) -> u64 {
        self.segments.iter().map(Segment::sector_count).sum()
    }

    pub fn marshal(&self, abi: Abi) -> Result<Vec<u8>> {
        if self.segments.is_empty() || self.segments.len() > MAX_SEGMENTS_PER_REQUEST {
            return Err(VbdError::SegmentCount(self.segments.len() as u8));
        }

        let mut buf = vec![0_u8; abi.slot_size()];
        codec::put_u8(&mut buf, 0, self.op.code());
        codec::put_u8(&mut buf, 1, self.segments.len() as u8);
        codec::put_u16(&mut buf, 2, self.handle, E);
        let off = codec::put_u64(&mut buf, abi.id_offset(), self.id, E);
        let mut off = codec::put_u64(&mut buf, off, self.sector, E);
        for seg in &self.segments {
            codec::put_u32(&mut buf, off, seg.gref, E);
            codec::put_u8(&mut buf, off + 4, seg.first_sector);
            codec::put_u8(&mut buf, off + 5, seg.last_sector);
            off += SEGMENT_SIZE;
        }
        Ok(buf)
    }

    pub fn parse(abi: Abi, buf: &[u8]) -> Result<Request> {
        if buf.len() < abi.slot_size() {
            return Err(VbdError::Protocol("short request slot"));
        }

        let (op, _) = codec::read_u8(buf, 0);
        let (nr_segs, _) = codec::read_u8(buf, 1);
        let (handle, _) = codec::read_u16(buf, 2, E);
        let (id, off) = codec::read_u64(buf, abi.id_offset(), E);
        let (sector, mut off) = codec::read_u64(buf, off, E);

        if nr_segs == 0 || nr_segs as usize > MAX_SEGMENTS_PER_REQUEST {
            return Err(VbdError::SegmentCount(nr_segs));
        }

        let mut segments = Vec::with_capacity(nr_segs as usize);
        for _ in 0..nr_segs {
            let (gref, _) = codec::read_u32(buf, off, E);
            let first_sector = buf[off + 4];
            let last_sector = buf[off + 5];
            if last_sector < first_sector
                || last_sector >= crate::sizes::SECTORS_PER_PAGE
            {
                return Err(VbdError::Protocol("bad segment sector range"));
            }
            segments.push(Segment { gref, first_sector, last_sector });
            off += SEGMENT_SIZE;
        }

        Ok(Request { op: op.into(), handle, id, sector, segments })
    }

    /// Best-effort field reads off a slot that may not decode fully, so a
    /// failure response can still echo the correlator.
    pub fn peek_id(abi: Abi, buf: &[u8]) -> u64 {
        codec::read_u64(buf, abi.id_offset(), E).0
    }

    pub fn peek_op(buf: &[u8]) -> BlkOp {
        buf[0].into()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Response {
    pub id: u64,
    pub op: BlkOp,
    pub status: BlkStatus,
}

impl Response {
    pub fn marshal(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0_u8; RESPONSE_SIZE];
        codec::put_u64(&mut buf, 0, self.id, E);
        codec::put_u8(&mut buf, 8, self.op.code());
        codec::put_u16(&mut buf, 10, self.status.code(), E);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Response> {
        if buf.len() < RESPONSE_SIZE {
            return Err(VbdError::Protocol("short response slot"));
        }
        let (id, _) = codec::read_u64(buf, 0, E);
        let (status, _) = codec::read_u16(buf, 10, E);
        Ok(Response { id, op: buf[8].into(), status: status.into() })
    }
}
