//! RAR 4.x and 5.0 block header walker.
//!
//! Only headers are decoded. Entry data can be handed out when it is stored
//! uncompressed. Compressed entries are listed by name but sealed; encrypted
//! or split entries are unreadable.

use memchr::memmem;

use super::{EntryContents, EntryError, Visitor};
use crate::inspect::{ContainerKind, Halt, InspectError};

/// Common prefix of both signatures: `Rar!\x1a\x07`.
const SIGNATURE_PREFIX: &[u8] = b"Rar!\x1a\x07";
/// Self-extracting archives carry an executable stub before the signature.
const MAX_SFX_SIZE: usize = 1024 * 1024;

// RAR 4 block types and flags
const RAR4_MAIN: u8 = 0x73;
const RAR4_FILE: u8 = 0x74;
const RAR4_END: u8 = 0x7b;
const RAR4_LONG_BLOCK: u16 = 0x8000;
const RAR4_MAIN_PASSWORD: u16 = 0x0080;
const RAR4_SPLIT_BEFORE: u16 = 0x0001;
const RAR4_SPLIT_AFTER: u16 = 0x0002;
const RAR4_PASSWORD: u16 = 0x0004;
const RAR4_LARGE: u16 = 0x0100;
const RAR4_UNICODE: u16 = 0x0200;
const RAR4_METHOD_STORE: u8 = 0x30;

// RAR 5 header types and flags
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_END: u64 = 5;
const RAR5_HAS_EXTRA: u64 = 0x0001;
const RAR5_HAS_DATA: u64 = 0x0002;
const RAR5_SPLIT_BEFORE: u64 = 0x0008;
const RAR5_SPLIT_AFTER: u64 = 0x0010;
const RAR5_FILE_MTIME: u64 = 0x0002;
const RAR5_FILE_CRC: u64 = 0x0004;
const RAR5_EXTRA_CRYPT: u64 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Rar4,
    Rar5,
}

pub(super) fn list_entries(payload: &[u8], visit: &mut Visitor<'_>) -> Result<(), Halt> {
    match locate(payload)? {
        (Format::Rar4, start) => walk_rar4(payload, start, visit),
        (Format::Rar5, start) => walk_rar5(payload, start, visit),
    }
}

/// Finds the signature and returns the offset of the first block after it.
fn locate(payload: &[u8]) -> Result<(Format, usize), InspectError> {
    let window = &payload[..payload.len().min(MAX_SFX_SIZE + SIGNATURE_PREFIX.len())];
    for pos in memmem::find_iter(window, SIGNATURE_PREFIX) {
        let rest = &payload[pos + SIGNATURE_PREFIX.len()..];
        if rest.starts_with(&[0x00]) {
            return Ok((Format::Rar4, pos + SIGNATURE_PREFIX.len() + 1));
        }
        if rest.starts_with(&[0x01, 0x00]) {
            return Ok((Format::Rar5, pos + SIGNATURE_PREFIX.len() + 2));
        }
    }
    Err(malformed("signature not found"))
}

/// Entry whose bytes may be available in place.
struct RarEntry<'a> {
    data: &'a [u8],
    unavailable: Option<EntryError>,
}

impl EntryContents for RarEntry<'_> {
    fn read_contents(&mut self, limit: u64) -> Result<Vec<u8>, EntryError> {
        if let Some(err) = &self.unavailable {
            return Err(err.clone());
        }
        if self.data.len() as u64 > limit {
            return Err(EntryError::TooLarge);
        }
        Ok(self.data.to_vec())
    }
}

fn walk_rar4(payload: &[u8], start: usize, visit: &mut Visitor<'_>) -> Result<(), Halt> {
    let mut pos = start;
    while pos < payload.len() {
        let mut base = Fields::new(payload, pos);
        let _crc = base.u16()?;
        let head_type = base.u8()?;
        let flags = base.u16()?;
        let head_size = usize::from(base.u16()?);
        if head_size < 7 {
            return Err(malformed("block header too small").into());
        }
        let header_end = end_of(pos, head_size, payload.len())?;
        let header = &payload[pos..header_end];

        match head_type {
            RAR4_MAIN => {
                if flags & RAR4_MAIN_PASSWORD != 0 {
                    return Err(malformed("archive headers are encrypted").into());
                }
                pos = header_end;
            }
            RAR4_FILE => {
                let mut f = Fields::new(header, 7);
                let mut packed = u64::from(f.u32()?);
                // unpacked size, host OS, CRC, mtime, version
                f.skip(4 + 1 + 4 + 4 + 1)?;
                let method = f.u8()?;
                let name_size = usize::from(f.u16()?);
                f.skip(4)?; // attributes
                if flags & RAR4_LARGE != 0 {
                    packed |= u64::from(f.u32()?) << 32;
                    f.skip(4)?;
                }
                let name = rar4_name(f.take(name_size)?, flags & RAR4_UNICODE != 0);
                let data_end = end_of(header_end, to_usize(packed)?, payload.len())?;

                let unavailable = if flags & RAR4_PASSWORD != 0 {
                    Some(EntryError::Unreadable("encrypted".to_string()))
                } else if flags & (RAR4_SPLIT_BEFORE | RAR4_SPLIT_AFTER) != 0 {
                    Some(EntryError::Unreadable("split across volumes".to_string()))
                } else if method != RAR4_METHOD_STORE {
                    Some(EntryError::Sealed("compressed"))
                } else {
                    None
                };
                visit(
                    &name,
                    &mut RarEntry {
                        data: &payload[header_end..data_end],
                        unavailable,
                    },
                )?;
                pos = data_end;
            }
            RAR4_END => return Ok(()),
            _ => {
                let added = if flags & RAR4_LONG_BLOCK != 0 {
                    Fields::new(header, 7).u32()?
                } else {
                    0
                };
                pos = end_of(header_end, to_usize(u64::from(added))?, payload.len())?;
            }
        }
    }
    Ok(())
}

/// RAR 4 names are OEM bytes, optionally followed by a NUL and a compact
/// UTF-16 encoding relative to those bytes.
fn rar4_name(raw: &[u8], unicode: bool) -> String {
    if unicode {
        if let Some(nul) = memchr::memchr(0, raw) {
            return decode_unicode_name(&raw[..nul], &raw[nul + 1..]);
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn decode_unicode_name(ascii: &[u8], encoded: &[u8]) -> String {
    let mut encoded = encoded.iter().copied();
    let Some(high) = encoded.next() else {
        return String::from_utf8_lossy(ascii).into_owned();
    };
    let high = u16::from(high) << 8;

    let mut out: Vec<u16> = Vec::with_capacity(ascii.len());
    let mut flags = 0u8;
    let mut flag_bits = 0;
    loop {
        if flag_bits == 0 {
            let Some(next) = encoded.next() else { break };
            flags = next;
            flag_bits = 8;
        }
        match flags >> 6 {
            0 => {
                let Some(lo) = encoded.next() else { break };
                out.push(u16::from(lo));
            }
            1 => {
                let Some(lo) = encoded.next() else { break };
                out.push(u16::from(lo) | high);
            }
            2 => {
                let (Some(lo), Some(hi)) = (encoded.next(), encoded.next()) else {
                    break;
                };
                out.push(u16::from_le_bytes([lo, hi]));
            }
            _ => {
                // Run copied from the OEM name, optionally shifted
                let Some(length) = encoded.next() else { break };
                if length & 0x80 != 0 {
                    let Some(correction) = encoded.next() else { break };
                    for _ in 0..usize::from(length & 0x7f) + 2 {
                        let Some(&c) = ascii.get(out.len()) else { break };
                        out.push(u16::from(c.wrapping_add(correction)) | high);
                    }
                } else {
                    for _ in 0..usize::from(length) + 2 {
                        let Some(&c) = ascii.get(out.len()) else { break };
                        out.push(u16::from(c));
                    }
                }
            }
        }
        flags <<= 2;
        flag_bits -= 2;
    }
    String::from_utf16_lossy(&out)
}

fn walk_rar5(payload: &[u8], start: usize, visit: &mut Visitor<'_>) -> Result<(), Halt> {
    let mut pos = start;
    while pos < payload.len() {
        let mut f = Fields::new(payload, pos);
        f.skip(4)?; // header CRC
        let head_size = to_usize(f.vint()?)?;
        let header_end = end_of(f.pos, head_size, payload.len())?;

        let mut f = Fields::new(&payload[..header_end], f.pos);
        let head_type = f.vint()?;
        let head_flags = f.vint()?;
        let extra_size = if head_flags & RAR5_HAS_EXTRA != 0 {
            to_usize(f.vint()?)?
        } else {
            0
        };
        let data_size = if head_flags & RAR5_HAS_DATA != 0 {
            to_usize(f.vint()?)?
        } else {
            0
        };
        let data_end = end_of(header_end, data_size, payload.len())?;

        match head_type {
            RAR5_FILE => {
                let file_flags = f.vint()?;
                let _unpacked = f.vint()?;
                let _attributes = f.vint()?;
                if file_flags & RAR5_FILE_MTIME != 0 {
                    f.skip(4)?;
                }
                if file_flags & RAR5_FILE_CRC != 0 {
                    f.skip(4)?;
                }
                let compression = f.vint()?;
                let _host_os = f.vint()?;
                let name_len = to_usize(f.vint()?)?;
                let name = String::from_utf8_lossy(f.take(name_len)?).into_owned();

                let extra_start = header_end
                    .checked_sub(extra_size)
                    .filter(|&start| start >= f.pos)
                    .ok_or_else(|| malformed("extra area out of bounds"))?;
                let encrypted = has_crypt_record(&payload[extra_start..header_end])?;

                let unavailable = if encrypted {
                    Some(EntryError::Unreadable("encrypted".to_string()))
                } else if head_flags & (RAR5_SPLIT_BEFORE | RAR5_SPLIT_AFTER) != 0 {
                    Some(EntryError::Unreadable("split across volumes".to_string()))
                } else if (compression >> 7) & 0x07 != 0 {
                    Some(EntryError::Sealed("compressed"))
                } else {
                    None
                };
                visit(
                    &name,
                    &mut RarEntry {
                        data: &payload[header_end..data_end],
                        unavailable,
                    },
                )?;
            }
            RAR5_ENCRYPTION => return Err(malformed("archive headers are encrypted").into()),
            RAR5_END => return Ok(()),
            _ => {}
        }
        pos = data_end;
    }
    Ok(())
}

fn has_crypt_record(extra: &[u8]) -> Result<bool, InspectError> {
    let mut f = Fields::new(extra, 0);
    while f.pos < extra.len() {
        let size = to_usize(f.vint()?)?;
        let record_end = end_of(f.pos, size, extra.len())?;
        if f.vint()? == RAR5_EXTRA_CRYPT {
            return Ok(true);
        }
        f.pos = record_end;
    }
    Ok(false)
}

/// Little-endian field reader over a header.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Fields { buf, pos }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], InspectError> {
        let end = end_of(self.pos, len, self.buf.len())?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), InspectError> {
        self.take(len).map(drop)
    }

    fn u8(&mut self) -> Result<u8, InspectError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, InspectError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, InspectError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// RAR 5 variable length integer: 7 bits per byte, low bits first.
    fn vint(&mut self) -> Result<u64, InspectError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(malformed("variable length integer too long"))
    }
}

fn end_of(start: usize, len: usize, limit: usize) -> Result<usize, InspectError> {
    start
        .checked_add(len)
        .filter(|&end| end <= limit)
        .ok_or_else(|| malformed("truncated archive"))
}

fn to_usize(value: u64) -> Result<usize, InspectError> {
    usize::try_from(value).map_err(|_| malformed("size out of range"))
}

fn malformed(message: &str) -> InspectError {
    InspectError::MalformedArchive {
        kind: ContainerKind::Rar.name(),
        message: message.to_string(),
    }
}
