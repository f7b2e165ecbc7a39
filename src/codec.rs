//! Byte-level readers and writers shared by the two wire surfaces: the VHD
//! on-disk format (big-endian) and the blkif ring (little-endian). Every
//! call site passes the endianness explicitly.

use crate::{Result, VbdError};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Endian {
    Big,
    Little,
}

pub fn read_u8(buf: &[u8], off: usize) -> (u8, usize) {
    (buf[off], off + 1)
}

pub fn read_u16(buf: &[u8], off: usize, e: Endian) -> (u16, usize) {
    let b: [u8; 2] = buf[off..off + 2].try_into().unwrap();
    let v = match e {
        Endian::Big => u16::from_be_bytes(b),
        Endian::Little => u16::from_le_bytes(b),
    };
    (v, off + 2)
}

pub fn read_u32(buf: &[u8], off: usize, e: Endian) -> (u32, usize) {
    let b: [u8; 4] = buf[off..off + 4].try_into().unwrap();
    let v = match e {
        Endian::Big => u32::from_be_bytes(b),
        Endian::Little => u32::from_le_bytes(b),
    };
    (v, off + 4)
}

pub fn read_u64(buf: &[u8], off: usize, e: Endian) -> (u64, usize) {
    let b: [u8; 8] = buf[off..off + 8].try_into().unwrap();
    let v = match e {
        Endian::Big => u64::from_be_bytes(b),
        Endian::Little => u64::from_le_bytes(b),
    };
    (v, off + 8)
}

pub fn put_u8(buf: &mut [u8], off: usize, v: u8) -> usize {
    buf[off] = v;
    off + 1
}

pub fn put_u16(buf: &mut [u8], off: usize, v: u16, e: Endian) -> usize {
    let b = match e {
        Endian::Big => v.to_be_bytes(),
        Endian::Little => v.to_le_bytes(),
    };
    buf[off..off + 2].copy_from_slice(&b);
    off + 2
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32, e: Endian) -> usize {
    let b = match e {
        Endian::Big => v.to_be_bytes(),
        Endian::Little => v.to_le_bytes(),
    };
    buf[off..off + 4].copy_from_slice(&b);
    off + 4
}

pub fn put_u64(buf: &mut [u8], off: usize, v: u64, e: Endian) -> usize {
    let b = match e {
        Endian::Big => v.to_be_bytes(),
        Endian::Little => v.to_le_bytes(),
    };
    buf[off..off + 8].copy_from_slice(&b);
    off + 8
}

/// Writes `s` into `buf[off..off + len]`, NUL-padding the tail. Longer
/// inputs are truncated to `len`.
pub fn put_padded(buf: &mut [u8], off: usize, s: &[u8], len: usize) -> usize {
    let n = s.len().min(len);
    buf[off..off + n].copy_from_slice(&s[..n]);
    buf[off + n..off + len].fill(0);
    off + len
}

const BOM_BE: u16 = 0xFEFF;
const BOM_LE: u16 = 0xFFFE; // a big-endian read of an LE BOM

/// Decodes UTF-16 into codepoints. Units are big-endian unless a leading
/// little-endian BOM says otherwise; a leading BOM is consumed either way.
/// Surrogate pairs are combined; an unpaired surrogate is an error.
pub fn decode_utf16(buf: &[u8]) -> Result<Vec<u32>> {
    if buf.len() % 2 != 0 {
        return Err(VbdError::OddUtf16Length(buf.len()));
    }

    let mut endian = Endian::Big;
    let mut off = 0;
    if buf.len() >= 2 {
        let (unit, _) = read_u16(buf, 0, Endian::Big);
        match unit {
            BOM_BE => off = 2,
            BOM_LE => {
                endian = Endian::Little;
                off = 2;
            }
            _ => (),
        }
    }

    let mut out = Vec::with_capacity((buf.len() - off) / 2);
    let mut idx = off / 2;
    while off < buf.len() {
        let (unit, next) = read_u16(buf, off, endian);
        off = next;
        match unit {
            0xD800..=0xDBFF => {
                if off >= buf.len() {
                    return Err(VbdError::UnpairedSurrogate(idx));
                }
                let (low, next) = read_u16(buf, off, endian);
                if !(0xDC00..=0xDFFF).contains(&low) {
                    return Err(VbdError::UnpairedSurrogate(idx));
                }
                off = next;
                idx += 1;
                let cp = 0x10000
                    + (((unit as u32 - 0xD800) << 10) | (low as u32 - 0xDC00));
                out.push(cp);
            }
            0xDC00..=0xDFFF => return Err(VbdError::UnpairedSurrogate(idx)),
            _ => out.push(unit as u32),
        }
        idx += 1;
    }

    Ok(out)
}

/// Encodes codepoints as UTF-16, emitting surrogate pairs for codepoints
/// beyond the BMP. No BOM is written.
pub fn encode_utf16(codepoints: &[u32], e: Endian) -> Vec<u8> {
    let mut out = Vec::with_capacity(codepoints.len() * 2);
    let mut unit = |v: u16| {
        let b = match e {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        out.extend_from_slice(&b);
    };
    for &cp in codepoints {
        if cp >= 0x10000 {
            let v = cp - 0x10000;
            unit(0xD800 + (v >> 10) as u16);
            unit(0xDC00 + (v & 0x3FF) as u16);
        } else {
            unit(cp as u16);
        }
    }
    out
}

/// Decoded codepoints as a `String`; codepoints outside Unicode scalar
/// range are replaced.
pub fn utf16_to_string(buf: &[u8]) -> Result<String> {
    let cps = decode_utf16(buf)?;
    Ok(cps
        .into_iter()
        .map(|cp| char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
