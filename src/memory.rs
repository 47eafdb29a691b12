//! Sparse, page-granular firmware image.
use std::collections::BTreeMap;
use std::fmt;

/// Granularity of the image store.
pub const PAGE_SIZE: u32 = 256;
/// Value of bytes never written.
pub const FILL: u8 = 0xff;

/// One populated page plus the sub-range actually written.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE as usize]>,
    min: u8,
    max: u8,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page[{:02x}..={:02x}]({})",
            self.min,
            self.max,
            hex::encode(&self.data[self.min as usize..=self.max as usize])
        )
    }
}

impl Page {
    fn new(offset: u8) -> Page {
        Page {
            data: Box::new([FILL; PAGE_SIZE as usize]),
            min: offset,
            max: offset,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Lowest written offset.
    pub fn min(&self) -> u8 {
        self.min
    }

    /// Highest written offset.
    pub fn max(&self) -> u8 {
        self.max
    }

    /// Written sub-range, fill bytes inside it included.
    pub fn written(&self) -> &[u8] {
        &self.data[self.min as usize..=self.max as usize]
    }
}

/// Inclusive address range of contiguous written bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Area {
    pub min: u32,
    pub max: u32,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} - 0x{:08X}", self.min, self.max)
    }
}

impl Area {
    /// Byte count, an area always holds at least one byte.
    pub fn size(&self) -> u64 {
        self.max as u64 - self.min as u64 + 1
    }
}

/// Mapping from page base address to page.
///
/// A page exists iff at least one byte in it has been written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMemory {
    pages: BTreeMap<u32, Page>,
}

pub const fn page_base(address: u32) -> u32 {
    address & !(PAGE_SIZE - 1)
}

impl PageMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of populated pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        let offset = (address - page_base(address)) as u8;
        let page = self
            .pages
            .entry(page_base(address))
            .or_insert_with(|| Page::new(offset));
        page.data[offset as usize] = value;
        page.min = page.min.min(offset);
        page.max = page.max.max(offset);
    }

    /// Write `data` at `address`. Bytes beyond the 32-bit address space are
    /// dropped.
    pub fn write(&mut self, address: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            match address.checked_add(i as u32) {
                Some(a) => self.write_byte(a, b),
                None => {
                    log::warn!("data beyond 0xFFFFFFFF dropped");
                    break;
                }
            }
        }
    }

    pub fn read_byte(&self, address: u32) -> u8 {
        self.pages
            .get(&page_base(address))
            .map(|p| p.data[(address - page_base(address)) as usize])
            .unwrap_or(FILL)
    }

    /// Fill `buf` from `address`, unwritten bytes read as [`FILL`].
    pub fn read(&self, address: u32, buf: &mut [u8]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = address
                .checked_add(i as u32)
                .map(|a| self.read_byte(a))
                .unwrap_or(FILL);
        }
    }

    pub fn page(&self, base: u32) -> Option<&Page> {
        self.pages.get(&base)
    }

    /// Populated pages in ascending address order.
    pub fn pages(&self) -> impl Iterator<Item = (u32, &Page)> {
        self.pages.iter().map(|(&base, page)| (base, page))
    }

    pub fn min_address(&self) -> Option<u32> {
        self.pages
            .iter()
            .next()
            .map(|(&base, page)| base + page.min as u32)
    }

    pub fn max_address(&self) -> Option<u32> {
        self.pages
            .iter()
            .next_back()
            .map(|(&base, page)| base + page.max as u32)
    }

    /// Coalesce the written sub-ranges into the minimal ascending list of
    /// contiguous areas.
    pub fn areas(&self) -> Vec<Area> {
        let mut areas: Vec<Area> = Vec::new();
        for (&base, page) in &self.pages {
            let min = base + page.min as u32;
            let max = base + page.max as u32;
            match areas.last_mut() {
                Some(last) if last.max as u64 + 1 == min as u64 => last.max = max,
                _ => areas.push(Area { min, max }),
            }
        }
        areas
    }

    /// Total bytes covered by [`PageMemory::areas`].
    pub fn total_len(&self) -> u64 {
        self.areas().iter().map(Area::size).sum()
    }
}
