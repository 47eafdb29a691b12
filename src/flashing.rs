//! Erase, write, verify and read workflows over a protocol session.
use std::{collections::BTreeSet, thread::sleep, time::Duration};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    constants::INITIAL_BAUD,
    device::Device,
    memory::PageMemory,
    transport::SerialTransport,
    types::{EraseStatus, MemoryArea},
    variant::{BindOptions, Protocol, Variant},
};

/// Outcome of an erase pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EraseSummary {
    /// Pages whose erase unit was erased by this pass.
    pub erased: usize,
    /// Pages found blank or sharing an already erased unit.
    pub skipped: usize,
}

pub struct Flashing<P: Protocol> {
    protocol: P,
    erase_page_wait: Duration,
    write_page_wait: Duration,
    progress: bool,
    verbose: bool,
}

impl Flashing<Variant<SerialTransport>> {
    /// Open `port` for `device` and pick the protocol variant of its family.
    pub fn open(device: &Device, port: &str, reset: bool) -> Result<Self> {
        let mut transport = SerialTransport::open(port, INITIAL_BAUD)?;
        if reset {
            log::debug!("Pulsing DTR/RTS to enter boot mode");
            transport.enter_boot_mode()?;
        }
        let protocol = Variant::new(device.family, transport);
        Ok(Flashing::new(protocol).with_page_waits(device.erase_page_wait, device.write_page_wait))
    }
}

impl<P: Protocol> Flashing<P> {
    pub fn new(protocol: P) -> Self {
        Flashing {
            protocol,
            erase_page_wait: Duration::ZERO,
            write_page_wait: Duration::ZERO,
            progress: false,
            verbose: false,
        }
    }

    pub fn with_page_waits(mut self, erase: Duration, write: Duration) -> Self {
        self.erase_page_wait = erase;
        self.write_page_wait = write;
        self
    }

    /// Show a progress bar per pass.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Log every differing byte on verify.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Connect and negotiate up to P/E mode.
    pub fn start(&mut self, opts: &BindOptions) -> Result<()> {
        self.protocol
            .connect()
            .context("boot program did not answer")?;
        self.protocol.bind(opts).context("bind failed")?;
        self.dump_info();
        Ok(())
    }

    pub fn dump_info(&self) {
        if let Some(device) = self.protocol.device() {
            log::info!("Chip: {} [{}]", device, self.protocol.family());
        }
        log::info!("Page size: {} bytes", self.protocol.page_size());
        for area in self.protocol.areas() {
            log::info!("Flash: {} ({}KiB)", area, area.len() / 1024);
        }
    }

    /// Programming unit aligned addresses covering `image`, ascending.
    pub fn pages(&self, image: &PageMemory) -> Vec<u32> {
        let size = self.protocol.page_size();
        let mut pages = BTreeSet::new();
        for area in image.areas() {
            let mut addr = area.min - area.min % size;
            loop {
                pages.insert(addr);
                match addr.checked_add(size) {
                    Some(next) if next <= area.max => addr = next,
                    _ => break,
                }
            }
        }
        pages.into_iter().collect()
    }

    fn page_data(&self, image: &PageMemory, address: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.protocol.page_size() as usize];
        image.read(address, &mut buf);
        buf
    }

    fn progress_bar(&self, message: &'static str, len: u64) -> Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:.green.bold} {percent:>3}% [{bar:30}] {bytes:>10} (ETA {eta})",
            )?
            .progress_chars("=> "),
        );
        bar.set_message(message);
        Ok(bar)
    }

    fn check_areas(&self, pages: &[u32]) -> Result<()> {
        let areas = self.protocol.areas();
        if areas.is_empty() {
            return Ok(());
        }
        let size = self.protocol.page_size();
        for &addr in pages {
            let last = addr + (size - 1);
            if !areas.iter().any(|a| a.contains(addr) && a.contains(last)) {
                anyhow::bail!("page 0x{:08X} is outside the device flash", addr);
            }
        }
        Ok(())
    }

    /// Erase every unit touched by `image`. Stops at the first failure.
    pub fn erase(&mut self, image: &PageMemory) -> Result<EraseSummary> {
        let pages = self.pages(image);
        self.check_areas(&pages)?;
        let size = self.protocol.page_size();
        let bar = self.progress_bar("Erasing", pages.len() as u64 * size as u64)?;

        let mut summary = EraseSummary::default();
        for &addr in &pages {
            let status = self
                .protocol
                .erase_page(addr)
                .with_context(|| format!("erase failed at 0x{:08X}", addr))?;
            match status {
                EraseStatus::EraseOk => {
                    summary.erased += 1;
                    if !self.erase_page_wait.is_zero() {
                        sleep(self.erase_page_wait);
                    }
                }
                EraseStatus::CheckOk => summary.skipped += 1,
            }
            bar.inc(size as u64);
        }
        bar.finish();
        log::info!(
            "Erase: {} pages erased, {} already blank",
            summary.erased,
            summary.skipped
        );
        Ok(summary)
    }

    /// Program every page of `image`, unwritten bytes as `0xFF`.
    pub fn write(&mut self, image: &PageMemory) -> Result<usize> {
        let pages = self.pages(image);
        self.check_areas(&pages)?;
        let size = self.protocol.page_size();
        let bar = self.progress_bar("Writing", pages.len() as u64 * size as u64)?;

        self.protocol
            .select_write_area(true)
            .context("write area selection failed")?;
        for &addr in &pages {
            let data = self.page_data(image, addr);
            self.protocol
                .write_page(addr, &data)
                .with_context(|| format!("write failed at 0x{:08X}", addr))?;
            if !self.write_page_wait.is_zero() {
                sleep(self.write_page_wait);
            }
            bar.inc(size as u64);
        }
        self.protocol
            .select_write_area(false)
            .context("leaving write area selection failed")?;
        bar.finish();
        log::info!("Write: {} pages", pages.len());
        Ok(pages.len())
    }

    /// Compare the device against `image`, returns the number of differing
    /// bytes. Padding bytes outside the image are compared as `0xFF`.
    pub fn verify(&mut self, image: &PageMemory) -> Result<usize> {
        let pages = self.pages(image);
        let size = self.protocol.page_size();
        let bar = self.progress_bar("Verifying", pages.len() as u64 * size as u64)?;

        let mut mismatches = 0;
        for &addr in &pages {
            let expected = self.page_data(image, addr);
            let report = self
                .protocol
                .verify_page(addr, &expected)
                .with_context(|| format!("verify failed at 0x{:08X}", addr))?;
            if !report.is_ok() {
                log::warn!(
                    "Page 0x{:08X}: {} bytes differ",
                    addr,
                    report.mismatches.len()
                );
                if self.verbose {
                    for (offset, want, got) in &report.mismatches {
                        log::info!(
                            "  0x{:08X}: expected {:02X}, read {:02X}",
                            addr + offset,
                            want,
                            got
                        );
                    }
                }
            }
            mismatches += report.mismatches.len();
            bar.inc(size as u64);
        }
        bar.finish();
        if mismatches == 0 {
            log::info!("Verify: {} pages OK", pages.len());
        } else {
            log::error!("Verify: {} bytes differ", mismatches);
        }
        Ok(mismatches)
    }

    /// Read `start..=end` into a fresh image.
    pub fn read(&mut self, start: u32, end: u32) -> Result<PageMemory> {
        anyhow::ensure!(
            start <= end,
            "read range 0x{:08X} - 0x{:08X} is empty",
            start,
            end
        );
        let size = self.protocol.page_size();
        let range = MemoryArea { start, end };
        let bar = self.progress_bar("Reading", range.len())?;

        let mut image = PageMemory::new();
        let mut buf = vec![0u8; size as usize];
        let mut addr = start - start % size;
        loop {
            self.protocol
                .read_page(addr, &mut buf)
                .with_context(|| format!("read failed at 0x{:08X}", addr))?;
            let lo = start.max(addr);
            let hi = end.min(addr + (size - 1));
            image.write(lo, &buf[(lo - addr) as usize..=(hi - addr) as usize]);
            bar.inc((hi - lo) as u64 + 1);
            match addr.checked_add(size) {
                Some(next) if next <= end => addr = next,
                _ => break,
            }
        }
        bar.finish();
        log::info!("Read: {} bytes", range.len());
        Ok(image)
    }

    /// Leave the session and release the port.
    pub fn end(&mut self) {
        self.protocol.end();
    }
}
