//! Firmware file formats
use std::fmt::Write as _;
use std::path::Path;
use std::str;

use anyhow::Result;
use object::{
    Endianness, elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader,
};

use crate::error::Error;
use crate::memory::PageMemory;

/// Data bytes per emitted S-record line.
const SREC_LINE_DATA: usize = 32;
/// Largest S0 payload the one-byte record length can carry.
const SREC_HEADER_MAX: usize = 0xff - 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    SRecord,
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

/// Decoded Motorola S-record file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SRecordImage {
    pub memory: PageMemory,
    /// Payload of the S0 record.
    pub header: Vec<u8>,
    /// Start address carried by the S7/S8/S9 record.
    pub entry: Option<u32>,
}

/// Address width in bytes of a record type.
fn address_width(kind: u8) -> Option<usize> {
    match kind {
        0 | 1 | 5 | 9 => Some(2),
        2 | 6 | 8 => Some(3),
        3 | 7 => Some(4),
        _ => None,
    }
}

fn parse_error(line: usize, reason: impl Into<String>) -> Error {
    Error::Parse {
        line,
        reason: reason.into(),
    }
}

/// Decode S-record text into a sparse image.
///
/// Any malformed record or checksum mismatch aborts the whole load.
pub fn decode_srec(text: &str) -> crate::Result<SRecordImage> {
    let mut image = SRecordImage::default();
    for (n, line) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        if !matches!(chars.next(), Some('S') | Some('s')) {
            return Err(parse_error(line_no, "record does not start with 'S'"));
        }
        let kind = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| parse_error(line_no, "missing record type"))? as u8;
        let width =
            address_width(kind).ok_or_else(|| parse_error(line_no, format!("type S{}", kind)))?;

        let bytes =
            hex::decode(&line[2..]).map_err(|e| parse_error(line_no, format!("bad hex: {}", e)))?;
        if bytes.len() < 1 + width + 1 {
            return Err(parse_error(line_no, "record too short"));
        }
        if bytes[0] as usize != bytes.len() - 1 {
            return Err(parse_error(
                line_no,
                format!(
                    "length byte 0x{:02X} but {} bytes follow",
                    bytes[0],
                    bytes.len() - 1
                ),
            ));
        }
        let (body, sum) = bytes.split_at(bytes.len() - 1);
        let expected = srec_checksum(body);
        if sum[0] != expected {
            return Err(parse_error(
                line_no,
                format!(
                    "checksum 0x{:02X}, calculated 0x{:02X}",
                    sum[0], expected
                ),
            ));
        }

        let address = body[1..1 + width]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32);
        let data = &body[1 + width..];
        match kind {
            0 => image.header = data.to_vec(),
            1..=3 => image.memory.write(address, data),
            5 | 6 => log::debug!("record count {}", address),
            _ => image.entry = Some(address),
        }
    }
    Ok(image)
}

/// One's complement of the low byte of the sum.
pub fn srec_checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn push_record(out: &mut String, kind: u8, width: usize, address: u32, data: &[u8]) {
    let mut body = Vec::with_capacity(1 + width + data.len());
    body.push((width + data.len() + 1) as u8);
    body.extend_from_slice(&address.to_be_bytes()[4 - width..]);
    body.extend_from_slice(data);
    let _ = writeln!(
        out,
        "S{}{}{:02X}",
        kind,
        hex::encode_upper(&body),
        srec_checksum(&body)
    );
}

/// Encode an image as S-record text.
///
/// The record type is the narrowest that fits the highest populated address.
/// Each page contributes its written sub-range, split into lines. A header
/// longer than one record is clipped.
pub fn encode_srec(memory: &PageMemory, header: &[u8], entry: Option<u32>) -> String {
    let header = &header[..header.len().min(SREC_HEADER_MAX)];
    let max = memory.max_address().unwrap_or(0).max(entry.unwrap_or(0));
    let (data_kind, end_kind, width) = if max <= 0xffff {
        (1, 9, 2)
    } else if max <= 0xff_ffff {
        (2, 8, 3)
    } else {
        (3, 7, 4)
    };

    let mut out = String::new();
    push_record(&mut out, 0, 2, 0, header);
    for (base, page) in memory.pages() {
        let start = base + page.min() as u32;
        for (i, chunk) in page.written().chunks(SREC_LINE_DATA).enumerate() {
            push_record(
                &mut out,
                data_kind,
                width,
                start + (i * SREC_LINE_DATA) as u32,
                chunk,
            );
        }
    }
    push_record(&mut out, end_kind, width, entry.unwrap_or(0), &[]);
    out
}

pub fn write_srec_file<P: AsRef<Path>>(path: P, memory: &PageMemory) -> Result<()> {
    let p = path.as_ref();
    let text = encode_srec(memory, b"rxprog", None);
    std::fs::write(p, text)?;
    log::info!("Wrote {} bytes to {}", memory.total_len(), p.display());
    Ok(())
}

/// Load a firmware file into a sparse image. `base` places raw binaries.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P, base: u32) -> Result<PageMemory> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let memory = match format {
        FirmwareFormat::SRecord => decode_srec(str::from_utf8(&raw)?)?.memory,
        FirmwareFormat::PlainHex => {
            let digits = raw
                .into_iter()
                .filter(|&c| c != b'\r' && c != b'\n')
                .collect::<Vec<u8>>();
            binary_at(base, &hex::decode(digits)?)
        }
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?)?,
        FirmwareFormat::ELF => read_elf(&raw)?,
        FirmwareFormat::Binary => binary_at(base, &raw),
    };
    anyhow::ensure!(!memory.is_empty(), "{} holds no data", p.display());
    Ok(memory)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["mot", "s19", "s28", "s37", "srec", "sx"].contains(&&*ext) {
        return FirmwareFormat::SRecord;
    }
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_text = |extra: &[u8]| {
        raw.iter().all(|&c| {
            (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r' || extra.contains(&c)
        })
    };
    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b'S') && is_text(b"S".as_slice()) {
        FirmwareFormat::SRecord
    } else if raw.first() == Some(&b':') && is_text(b":".as_slice()) {
        FirmwareFormat::IntelHex
    } else if is_text(&[]) {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

fn binary_at(base: u32, data: &[u8]) -> PageMemory {
    let mut memory = PageMemory::new();
    memory.write(base, data);
    memory
}

pub fn read_ihex(data: &str) -> Result<PageMemory> {
    use ihex::Record;

    let mut base_address = 0;
    let mut memory = PageMemory::new();

    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                memory.write(base_address + offset as u32, &value);
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    Ok(memory)
}

/// Loadable segments of an ELF32 file, placed at their physical addresses.
pub fn read_elf(elf_data: &[u8]) -> Result<PageMemory> {
    let file_kind = object::FileKind::parse(elf_data)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut memory = PageMemory::new();
    for segment in elf_header.program_headers(endian, elf_data)? {
        let p_paddr: u64 = segment.p_paddr(endian).into();
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
            log::info!(
                "Found loadable segment, physical address: {:#010x}, size: {:#x}",
                p_paddr,
                segment_data.len()
            );
            memory.write(p_paddr as u32, segment_data);
        }
    }

    anyhow::ensure!(!memory.is_empty(), "empty ELF file");
    Ok(memory)
}
