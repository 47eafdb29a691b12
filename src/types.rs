//! Descriptors exchanged during capability negotiation.
use std::fmt;

use scroll::{BE, Pread};

use crate::error::{Error, Result};

/// Target chip as reported by the supported device inquiry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub code: u32,
    pub name: String,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:08x})", self.name, self.code)
    }
}

impl DeviceDescriptor {
    /// `count, { chars, code(4), name(chars - 4) }*`
    pub fn parse_list(raw: &[u8]) -> Result<Vec<DeviceDescriptor>> {
        let count = raw.pread::<u8>(0)? as usize;
        let mut offset = 1;
        let mut devices = Vec::with_capacity(count);
        for _ in 0..count {
            let chars = raw.pread::<u8>(offset)? as usize;
            if chars < 4 {
                return Err(Error::Protocol(format!(
                    "device entry with {} characters",
                    chars
                )));
            }
            let code = raw.pread_with::<u32>(offset + 1, BE)?;
            let name_at = offset + 5;
            let name = raw
                .get(name_at..name_at + chars - 4)
                .ok_or_else(|| Error::Protocol("truncated device name".into()))?;
            devices.push(DeviceDescriptor {
                code,
                name: String::from_utf8_lossy(name).trim_end().to_string(),
            });
            offset = name_at + chars - 4;
        }
        Ok(devices)
    }
}

/// Clock modes the boot program accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockMode(pub u8);

impl ClockMode {
    pub fn parse_list(raw: &[u8]) -> Result<Vec<ClockMode>> {
        let count = raw.pread::<u8>(0)? as usize;
        let modes = raw
            .get(1..1 + count)
            .ok_or_else(|| Error::Protocol("truncated clock mode list".into()))?;
        Ok(modes.iter().copied().map(ClockMode).collect())
    }
}

/// Legal multiplication ratios of one internal clock. Negative values are
/// division ratios.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiplier {
    pub ratios: Vec<i8>,
}

impl Multiplier {
    pub fn parse_list(raw: &[u8]) -> Result<Vec<Multiplier>> {
        let types = raw.pread::<u8>(0)? as usize;
        let mut offset = 1;
        let mut list = Vec::with_capacity(types);
        for _ in 0..types {
            let n = raw.pread::<u8>(offset)? as usize;
            let ratios = raw
                .get(offset + 1..offset + 1 + n)
                .ok_or_else(|| Error::Protocol("truncated multiplier list".into()))?;
            list.push(Multiplier {
                ratios: ratios.iter().map(|&r| r as i8).collect(),
            });
            offset += 1 + n;
        }
        Ok(list)
    }

    pub fn allows(&self, ratio: u8) -> bool {
        self.ratios.contains(&(ratio as i8))
    }
}

/// Operating frequency range of one internal clock, in 0.01 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrequencyRange {
    pub min: u16,
    pub max: u16,
}

impl fmt::Display for FrequencyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} - {}.{:02} MHz",
            self.min / 100,
            self.min % 100,
            self.max / 100,
            self.max % 100
        )
    }
}

impl FrequencyRange {
    pub fn parse_list(raw: &[u8]) -> Result<Vec<FrequencyRange>> {
        let types = raw.pread::<u8>(0)? as usize;
        (0..types)
            .map(|i| {
                Ok(FrequencyRange {
                    min: raw.pread_with::<u16>(1 + i * 4, BE)?,
                    max: raw.pread_with::<u16>(3 + i * 4, BE)?,
                })
            })
            .collect()
    }

    /// `hz` within range.
    pub fn contains_hz(&self, hz: u32) -> bool {
        let units = hz / 10_000;
        units >= self.min as u32 && units <= self.max as u32
    }
}

/// Inclusive flash address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryArea {
    pub start: u32,
    pub end: u32,
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} - 0x{:08X}", self.start, self.end)
    }
}

impl MemoryArea {
    /// `count, { start(4), end(4) }*`
    pub fn parse_list(raw: &[u8]) -> Result<Vec<MemoryArea>> {
        let count = raw.pread::<u8>(0)? as usize;
        (0..count)
            .map(|i| {
                MemoryArea {
                    start: raw.pread_with::<u32>(1 + i * 8, BE)?,
                    end: raw.pread_with::<u32>(5 + i * 8, BE)?,
                }
                .checked()
            })
            .collect()
    }

    fn checked(self) -> Result<MemoryArea> {
        if self.end < self.start {
            return Err(Error::Protocol(format!("inverted area {}", self)));
        }
        Ok(self)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    pub fn len(&self) -> u64 {
        self.end as u64 - self.start as u64 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Erase geometry of one area.
///
/// Families reporting plain ranges have exactly one block per entry, so
/// `block_size` equals the range length and `block_count` is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub area: MemoryArea,
    pub block_size: u32,
    pub block_count: u32,
}

impl Block {
    pub fn from_area(area: MemoryArea) -> Block {
        Block {
            area,
            block_size: area.len() as u32,
            block_count: 1,
        }
    }

    /// `count, { start(4), end(4) }*`
    pub fn parse_ranges(raw: &[u8]) -> Result<Vec<Block>> {
        MemoryArea::parse_list(raw)?
            .into_iter()
            .map(|area| {
                let block = Block::from_area(area);
                if block.block_size == 0 {
                    return Err(Error::Protocol(format!("area {} too large", area)));
                }
                Ok(block)
            })
            .collect()
    }

    /// `count, { start(4), end(4), block_size(4), block_count(4) }*`
    pub fn parse_geometry(raw: &[u8]) -> Result<Vec<Block>> {
        let count = raw.pread::<u8>(0)? as usize;
        (0..count)
            .map(|i| {
                let at = 1 + i * 16;
                let block = Block {
                    area: MemoryArea {
                        start: raw.pread_with::<u32>(at, BE)?,
                        end: raw.pread_with::<u32>(at + 4, BE)?,
                    }
                    .checked()?,
                    block_size: raw.pread_with::<u32>(at + 8, BE)?,
                    block_count: raw.pread_with::<u32>(at + 12, BE)?,
                };
                if block.block_size == 0 {
                    return Err(Error::Protocol("zero erase block size".into()));
                }
                Ok(block)
            })
            .collect()
    }

    /// Base address of the erase unit holding `address`.
    pub fn unit_base(&self, address: u32) -> Option<u32> {
        if !self.area.contains(address) {
            return None;
        }
        let index = (address - self.area.start) / self.block_size;
        if index >= self.block_count {
            return None;
        }
        Some(self.area.start + index * self.block_size)
    }
}

/// Answer to the framed device type inquiry, clocks in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceType {
    pub tag: [u8; 8],
    pub osc_max: u32,
    pub osc_min: u32,
    pub sys_max: u32,
    pub sys_min: u32,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type {} (input {} - {} Hz, system {} - {} Hz)",
            hex::encode(self.tag),
            self.osc_min,
            self.osc_max,
            self.sys_min,
            self.sys_max
        )
    }
}

impl DeviceType {
    pub fn parse(raw: &[u8]) -> Result<DeviceType> {
        if raw.len() < 24 {
            return Err(Error::Protocol(format!(
                "device type response of {} bytes",
                raw.len()
            )));
        }
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&raw[..8]);
        Ok(DeviceType {
            tag,
            osc_max: raw.pread_with::<u32>(8, BE)?,
            osc_min: raw.pread_with::<u32>(12, BE)?,
            sys_max: raw.pread_with::<u32>(16, BE)?,
            sys_min: raw.pread_with::<u32>(20, BE)?,
        })
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            code: u32::from_be_bytes([self.tag[0], self.tag[1], self.tag[2], self.tag[3]]),
            name: hex::encode_upper(self.tag),
        }
    }
}

/// Answer to the framed area information inquiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaInfo {
    pub kind: u8,
    pub area: MemoryArea,
    pub erase_unit: u32,
    pub write_unit: u32,
}

impl AreaInfo {
    /// `KOA(1) SAD(4) EAD(4) EAU(4) WAU(4)`
    pub fn parse(raw: &[u8]) -> Result<AreaInfo> {
        let info = AreaInfo {
            kind: raw.pread::<u8>(0)?,
            area: MemoryArea {
                start: raw.pread_with::<u32>(1, BE)?,
                end: raw.pread_with::<u32>(5, BE)?,
            }
            .checked()?,
            erase_unit: raw.pread_with::<u32>(9, BE)?,
            write_unit: raw.pread_with::<u32>(13, BE)?,
        };
        if info.erase_unit == 0 {
            return Err(Error::Protocol("zero erase unit".into()));
        }
        Ok(info)
    }

    pub fn block(&self) -> Block {
        Block {
            area: self.area,
            block_size: self.erase_unit,
            block_count: (self.area.len() / self.erase_unit as u64) as u32,
        }
    }
}

/// Outcome of a successful page erase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EraseStatus {
    /// Nothing to do: already blank or already erased this session.
    CheckOk,
    /// An erase command was issued.
    EraseOk,
}

/// Result of comparing one page against the expected image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyReport {
    pub address: u32,
    /// `(offset, expected, actual)` of every differing byte.
    pub mismatches: Vec<(u32, u8, u8)>,
}

impl VerifyReport {
    pub fn compare(address: u32, expected: &[u8], actual: &[u8]) -> VerifyReport {
        let mismatches = expected
            .iter()
            .zip(actual)
            .enumerate()
            .filter(|(_, (e, a))| e != a)
            .map(|(i, (&e, &a))| (i as u32, e, a))
            .collect();
        VerifyReport {
            address,
            mismatches,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_list() {
        let mut raw = vec![2, 10];
        raw.extend_from_slice(&[0x35, 0x36, 0x33, 0x54]);
        raw.extend_from_slice(b"RX63T ");
        raw.push(9);
        raw.extend_from_slice(&[0x35, 0x36, 0x33, 0x31]);
        raw.extend_from_slice(b"RX631");
        let devices = DeviceDescriptor::parse_list(&raw).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].code, 0x3536_3354);
        assert_eq!(devices[0].name, "RX63T");
        assert_eq!(devices[1].name, "RX631");
        assert!(DeviceDescriptor::parse_list(&raw[..8]).is_err());
    }

    #[test]
    fn parse_multipliers() {
        let raw = [2, 3, 1, 2, 4, 2, 0xff, 2];
        let list = Multiplier::parse_list(&raw).unwrap();
        assert_eq!(list[0].ratios, vec![1, 2, 4]);
        assert_eq!(list[1].ratios, vec![-1, 2]);
        assert!(list[0].allows(4));
        assert!(!list[1].allows(4));
    }

    #[test]
    fn frequency_range_units() {
        let list = FrequencyRange::parse_list(&[1, 0x01, 0xf4, 0x27, 0x10]).unwrap();
        assert_eq!(list[0], FrequencyRange { min: 500, max: 10000 });
        assert!(list[0].contains_hz(12_000_000));
        assert!(!list[0].contains_hz(120_000_000));
        assert_eq!(list[0].to_string(), "5.00 - 100.00 MHz");
    }

    #[test]
    fn block_unit_base() {
        let block = Block {
            area: MemoryArea {
                start: 0xfff8_0000,
                end: 0xffff_ffff,
            },
            block_size: 0x8000,
            block_count: 16,
        };
        assert_eq!(block.unit_base(0xfff8_0000), Some(0xfff8_0000));
        assert_eq!(block.unit_base(0xfff8_9234), Some(0xfff8_8000));
        assert_eq!(block.unit_base(0xffff_ffff), Some(0xffff_8000));
        assert_eq!(block.unit_base(0x0000_1000), None);

        let single = Block::from_area(MemoryArea {
            start: 0x1000,
            end: 0x1fff,
        });
        assert_eq!(single.unit_base(0x1abc), Some(0x1000));
    }

    #[test]
    fn device_ranges_are_validated() {
        let mut inverted = vec![1];
        inverted.extend_from_slice(&0x2000u32.to_be_bytes());
        inverted.extend_from_slice(&0x1000u32.to_be_bytes());
        assert!(matches!(
            Block::parse_ranges(&inverted),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            MemoryArea::parse_list(&inverted),
            Err(Error::Protocol(_))
        ));

        let mut full = vec![1];
        full.extend_from_slice(&0u32.to_be_bytes());
        full.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(Block::parse_ranges(&full), Err(Error::Protocol(_))));

        let mut geometry = inverted.clone();
        geometry.extend_from_slice(&0x100u32.to_be_bytes());
        geometry.extend_from_slice(&16u32.to_be_bytes());
        assert!(matches!(
            Block::parse_geometry(&geometry),
            Err(Error::Protocol(_))
        ));

        let mut info = vec![0];
        info.extend_from_slice(&0x2000u32.to_be_bytes());
        info.extend_from_slice(&0x1000u32.to_be_bytes());
        info.extend_from_slice(&0x100u32.to_be_bytes());
        info.extend_from_slice(&0x80u32.to_be_bytes());
        assert!(matches!(AreaInfo::parse(&info), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_device_type() {
        let mut raw = b"R5F572TK".to_vec();
        for v in [24_000_000u32, 8_000_000, 200_000_000, 2_000_000] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        let ty = DeviceType::parse(&raw).unwrap();
        assert_eq!(ty.osc_max, 24_000_000);
        assert_eq!(ty.sys_min, 2_000_000);
        assert_eq!(&ty.tag, b"R5F572TK");
        assert!(DeviceType::parse(&raw[..20]).is_err());
    }

    #[test]
    fn verify_report_counts_differences() {
        let report = VerifyReport::compare(0x100, &[1, 2, 3, 4], &[1, 0, 3, 5]);
        assert!(!report.is_ok());
        assert_eq!(report.mismatches, vec![(1, 2, 0), (3, 4, 5)]);
    }
}
