//! Legacy boot mode session (RX220, RX23x, RX24T, RX62x, RX63x, RX64M, RX65x).
use std::thread::sleep;

use super::family::{BlockFormat, EraseAddressing, Family, LegacyProfile};
use super::session::{BlankState, Phase, Selection, SessionState};
use super::{BindOptions, Protocol, synchronize};
use crate::constants::{
    DEFAULT_TIMEOUT,
    legacy::{ACK, BAUD_SETTLE, area, commands, responses},
};
use crate::error::{Error, Result};
use crate::protocol::legacy::{Command, EraseTarget, LegacyLink, SizeField};
use crate::transport::Transport;
use crate::types::{
    Block, ClockMode, DeviceDescriptor, EraseStatus, FrequencyRange, MemoryArea, Multiplier,
};

pub struct LegacySession<T> {
    family: Family,
    profile: &'static LegacyProfile,
    link: LegacyLink<T>,
    state: SessionState,
    devices: Vec<DeviceDescriptor>,
    device: Option<DeviceDescriptor>,
    clock_modes: Vec<ClockMode>,
    multipliers: Vec<Multiplier>,
    frequencies: Vec<FrequencyRange>,
    boot_areas: Vec<MemoryArea>,
    user_areas: Vec<MemoryArea>,
    data_areas: Vec<MemoryArea>,
    blocks: Vec<Block>,
    program_size: u32,
    baud: u32,
}

impl<T: Transport> LegacySession<T> {
    pub fn new(family: Family, profile: &'static LegacyProfile, transport: T) -> Self {
        LegacySession {
            family,
            profile,
            link: LegacyLink::new(transport),
            state: SessionState::new(),
            devices: Vec::new(),
            device: None,
            clock_modes: Vec::new(),
            multipliers: Vec::new(),
            frequencies: Vec::new(),
            boot_areas: Vec::new(),
            user_areas: Vec::new(),
            data_areas: Vec::new(),
            blocks: Vec::new(),
            program_size: profile.page_size,
            baud: crate::constants::INITIAL_BAUD,
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn clock_modes(&self) -> &[ClockMode] {
        &self.clock_modes
    }

    pub fn multipliers(&self) -> &[Multiplier] {
        &self.multipliers
    }

    pub fn frequencies(&self) -> &[FrequencyRange] {
        &self.frequencies
    }

    pub fn boot_areas(&self) -> &[MemoryArea] {
        &self.boot_areas
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Baud rate currently in use.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    fn select_device(&mut self) -> Result<()> {
        let raw = self
            .link
            .inquire(commands::DEVICE_INQUIRY, SizeField::U8)?;
        self.devices = DeviceDescriptor::parse_list(&raw)?;
        let device = self
            .devices
            .first()
            .cloned()
            .ok_or_else(|| Error::Protocol("boot program reports no devices".into()))?;
        log::info!("Device: {}", device);
        self.link
            .transfer_ack(Command::DeviceSelect { code: device.code })?;
        self.device = Some(device);
        self.state.advance(Phase::DeviceSelected)
    }

    fn select_clock(&mut self) -> Result<()> {
        let raw = self
            .link
            .inquire(commands::CLOCK_MODE_INQUIRY, SizeField::U8)?;
        self.clock_modes = ClockMode::parse_list(&raw)?;
        let mode = self.clock_modes.first().copied().unwrap_or(ClockMode(0));
        log::debug!("clock modes {:?}, selecting {}", self.clock_modes, mode.0);
        self.link
            .transfer_ack(Command::ClockModeSelect { mode: mode.0 })?;

        let raw = self
            .link
            .inquire(commands::MULTIPLIER_INQUIRY, SizeField::U8)?;
        self.multipliers = Multiplier::parse_list(&raw)?;
        let raw = self
            .link
            .inquire(commands::FREQUENCY_INQUIRY, SizeField::U8)?;
        self.frequencies = FrequencyRange::parse_list(&raw)?;
        for (i, range) in self.frequencies.iter().enumerate() {
            log::debug!("clock #{}: {}", i, range);
        }
        Ok(())
    }

    fn inquire_geometry(&mut self) -> Result<()> {
        let raw = self
            .link
            .inquire(commands::BOOT_AREA_INQUIRY, SizeField::U8)?;
        self.boot_areas = MemoryArea::parse_list(&raw)?;
        let raw = self
            .link
            .inquire(commands::USER_AREA_INQUIRY, SizeField::U8)?;
        self.user_areas = MemoryArea::parse_list(&raw)?;

        if self.profile.data_area {
            let raw = self
                .link
                .inquire(commands::DATA_AREA_INQUIRY, SizeField::U8)?;
            if raw.first().copied().unwrap_or(0) != 0 {
                let raw = self
                    .link
                    .inquire(commands::DATA_AREA_INFO_INQUIRY, SizeField::U8)?;
                self.data_areas = MemoryArea::parse_list(&raw)?;
            }
        }

        let raw = self
            .link
            .inquire(commands::BLOCK_INQUIRY, SizeField::U16)?;
        self.blocks = match self.profile.blocks {
            BlockFormat::Ranges => Block::parse_ranges(&raw)?,
            BlockFormat::Geometry => Block::parse_geometry(&raw)?,
        };

        let raw = self
            .link
            .inquire(commands::PROGRAM_SIZE_INQUIRY, SizeField::U8)?;
        self.program_size = u16::from_be_bytes([
            raw.first().copied().unwrap_or(0),
            raw.get(1).copied().unwrap_or(0),
        ]) as u32;
        if self.program_size != self.profile.page_size {
            log::warn!(
                "boot program reports {} byte programming unit, using {}",
                self.program_size,
                self.profile.page_size
            );
        }

        for a in &self.boot_areas {
            log::info!("User boot area: {}", a);
        }
        for a in &self.user_areas {
            log::info!("User area: {}", a);
        }
        for a in &self.data_areas {
            log::info!("Data area: {}", a);
        }
        log::debug!("{} erase block entries", self.blocks.len());
        Ok(())
    }

    fn change_speed(&mut self, opts: &BindOptions) -> Result<()> {
        let mut speed = opts.speed;
        if speed > self.profile.max_baud {
            log::warn!(
                "{} baud exceeds the {} maximum, using {}",
                speed,
                self.family,
                self.profile.max_baud
            );
            speed = self.profile.max_baud;
        }

        if !self.multipliers.is_empty() {
            if opts.multipliers.len() != self.multipliers.len() {
                return Err(Error::InvalidParameter(format!(
                    "{} multipliers given, device has {} clocks",
                    opts.multipliers.len(),
                    self.multipliers.len()
                )));
            }
            for (i, (&ratio, allowed)) in opts.multipliers.iter().zip(&self.multipliers).enumerate()
            {
                if !allowed.allows(ratio) {
                    return Err(Error::InvalidParameter(format!(
                        "multiplier {} not allowed for clock #{} ({:?})",
                        ratio, i, allowed.ratios
                    )));
                }
            }
        }
        for (i, (&ratio, range)) in opts.multipliers.iter().zip(&self.frequencies).enumerate() {
            let hz = opts.clock.saturating_mul(ratio as u32);
            if !range.contains_hz(hz) {
                log::warn!("clock #{} at {} Hz is outside {}", i, hz, range);
            }
        }

        self.link.transfer_ack(Command::BitRate {
            bit_rate: (speed / 100) as u16,
            clock: (opts.clock / 10_000) as u16,
            multipliers: opts.multipliers.clone(),
        })?;
        sleep(BAUD_SETTLE);
        self.link.transport_mut().change_baud(speed)?;
        self.baud = speed;

        self.link.send_byte(ACK)?;
        let confirm = self.link.recv_byte(DEFAULT_TIMEOUT)?;
        if confirm != ACK {
            return Err(Error::Protocol(format!(
                "bit rate confirmation 0x{:02X}",
                confirm
            )));
        }
        log::info!("Speed: {} baud", speed);
        self.state.advance(Phase::SpeedChanged)
    }

    fn enter_program_erase(&mut self, opts: &BindOptions) -> Result<()> {
        self.link.send(Command::Inquiry(commands::PROGRAM_ERASE))?;
        match self.link.recv_reply(commands::PROGRAM_ERASE)? {
            responses::ID_DISABLED => log::info!("ID code protection: disabled"),
            responses::ID_ENABLED => match opts.id {
                Some(id) => {
                    self.link.transfer_ack(Command::IdCodeCheck { id })?;
                    log::info!("ID code protection: unlocked");
                }
                None => {
                    log::warn!("ID code protection: enabled, no ID configured, flash is read-only");
                    self.state.id_protected = true;
                }
            },
            t => {
                return Err(Error::Protocol(format!(
                    "unexpected P/E transition response 0x{:02X}",
                    t
                )));
            }
        }
        self.state.advance(Phase::ProgramErase)?;
        self.state.selection = Selection::Idle;
        Ok(())
    }

    /// Whole user area blank check.
    fn blank_check(&mut self) -> Result<bool> {
        self.link
            .send(Command::Inquiry(commands::USER_AREA_BLANK_CHECK))?;
        match self.link.recv_reply(commands::USER_AREA_BLANK_CHECK) {
            Ok(ACK) => Ok(true),
            Ok(t) => Err(Error::Protocol(format!(
                "unexpected blank check response 0x{:02X}",
                t
            ))),
            Err(Error::Device { code, .. }) if code == responses::NOT_BLANK_CODE => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Erase unit base address and running block index of `address`.
    fn erase_unit(&self, address: u32) -> Option<(u32, u32)> {
        let mut index = 0;
        for block in &self.blocks {
            if let Some(base) = block.unit_base(address) {
                return Some((base, index + (base - block.area.start) / block.block_size));
            }
            index += block.block_count;
        }
        None
    }

    fn select_erase(&mut self) -> Result<()> {
        match self.state.selection {
            Selection::Erase => return Ok(()),
            Selection::WriteArea => self.end_write_select()?,
            Selection::Idle => (),
        }
        self.link
            .transfer_ack(Command::Inquiry(commands::ERASE_SELECT))?;
        self.state.selection = Selection::Erase;
        Ok(())
    }

    fn end_erase_select(&mut self) -> Result<()> {
        let target = match self.profile.erase {
            EraseAddressing::BlockNumber => EraseTarget::BlockEnd,
            EraseAddressing::Address => EraseTarget::AddressEnd,
        };
        self.state.selection = Selection::Idle;
        self.link.transfer_ack(Command::BlockErase(target))
    }

    fn end_write_select(&mut self) -> Result<()> {
        self.state.selection = Selection::Idle;
        self.link.transfer_ack(Command::ProgramEnd)
    }

    fn leave_selection(&mut self) -> Result<()> {
        match self.state.selection {
            Selection::Erase => self.end_erase_select(),
            Selection::WriteArea => self.end_write_select(),
            Selection::Idle => Ok(()),
        }
    }

    /// Log the boot program status after a device error.
    fn log_boot_status(&mut self) {
        match self
            .link
            .inquire(commands::BOOT_STATUS_INQUIRY, SizeField::U8)
        {
            Ok(raw) if raw.len() >= 2 => {
                log::warn!("boot status 0x{:02X}, error 0x{:02X}", raw[0], raw[1])
            }
            Ok(raw) => log::warn!("boot status {}", hex::encode(raw)),
            Err(e) => log::debug!("boot status inquiry failed: {}", e),
        }
    }

    fn read_area(&self, address: u32) -> u8 {
        if self.boot_areas.iter().any(|a| a.contains(address)) {
            area::USER_BOOT
        } else {
            area::USER
        }
    }

    fn check_page(&self, address: u32, len: usize) -> Result<()> {
        let page = self.profile.page_size;
        if len != page as usize || address % page != 0 {
            return Err(Error::InvalidParameter(format!(
                "page 0x{:08X}+{} is not a {} byte aligned page",
                address, len, page
            )));
        }
        Ok(())
    }
}

impl<T: Transport> Protocol for LegacySession<T> {
    fn family(&self) -> Family {
        self.family
    }

    fn state(&self) -> &SessionState {
        &self.state
    }

    fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    fn connect(&mut self) -> Result<()> {
        self.state
            .require(Phase::Disconnected, "connect on an open session")?;
        synchronize(self.link.transport_mut(), self.profile.connection_id)?;
        log::info!("Connected to {} boot program", self.family);
        self.state.advance(Phase::Connected)
    }

    fn bind(&mut self, opts: &BindOptions) -> Result<()> {
        self.state
            .require(Phase::Connected, "bind requires a connected session")?;
        self.select_device()?;
        self.select_clock()?;
        self.inquire_geometry()?;
        self.change_speed(opts)?;
        self.enter_program_erase(opts)
    }

    fn page_size(&self) -> u32 {
        self.profile.page_size
    }

    fn areas(&self) -> Vec<MemoryArea> {
        let mut areas = self.user_areas.clone();
        areas.extend_from_slice(&self.data_areas);
        areas
    }

    fn erase_page(&mut self, address: u32) -> Result<EraseStatus> {
        self.state.require_writable("erase requires P/E mode")?;

        if self.state.blank == BlankState::NotChecked {
            self.leave_selection()?;
            let blank = self.blank_check()?;
            log::info!("Blank check: {}", if blank { "blank" } else { "not blank" });
            self.state.blank = if blank {
                BlankState::BlankAll
            } else {
                BlankState::NotBlank
            };
        }
        if self.state.blank == BlankState::BlankAll {
            return Ok(EraseStatus::CheckOk);
        }

        let (base, index) = self.erase_unit(address).ok_or_else(|| {
            Error::InvalidParameter(format!("0x{:08X} is outside every erase block", address))
        })?;
        if self.state.is_erased(base) {
            return Ok(EraseStatus::CheckOk);
        }

        self.select_erase()?;
        let target = match self.profile.erase {
            EraseAddressing::BlockNumber => {
                let n = u8::try_from(index)
                    .ok()
                    .filter(|&n| n != 0xff)
                    .ok_or_else(|| {
                        Error::InvalidParameter(format!("erase block number {}", index))
                    })?;
                EraseTarget::Block(n)
            }
            EraseAddressing::Address => EraseTarget::Address(base),
        };
        if let Err(e) = self.link.transfer_ack(Command::BlockErase(target)) {
            if matches!(e, Error::Device { .. }) {
                self.log_boot_status();
            }
            return Err(e);
        }
        log::debug!("erased unit 0x{:08X}", base);
        self.state.mark_erased(base);
        Ok(EraseStatus::EraseOk)
    }

    fn select_write_area(&mut self, select: bool) -> Result<()> {
        if !select {
            if self.state.selection == Selection::WriteArea {
                self.end_write_select()?;
            }
            return Ok(());
        }

        self.state.require_writable("write requires P/E mode")?;
        match self.state.selection {
            Selection::WriteArea if !self.state.write_failed => return Ok(()),
            Selection::WriteArea => self.end_write_select()?,
            Selection::Erase => self.end_erase_select()?,
            Selection::Idle => (),
        }
        self.link
            .transfer_ack(Command::Inquiry(commands::USER_AREA_WRITE_SELECT))?;
        self.state.selection = Selection::WriteArea;
        self.state.write_failed = false;
        Ok(())
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if self.state.selection != Selection::WriteArea {
            return Err(Error::NotReady("write area not selected"));
        }
        if self.state.write_failed {
            return Err(Error::NotReady("previous page write failed"));
        }
        self.check_page(address, data.len())?;

        let result = self
            .link
            .send_program(address, data)
            .and_then(|_| self.link.recv_ack(commands::PROGRAM));
        if let Err(e) = result {
            self.state.write_failed = true;
            if matches!(e, Error::Device { .. }) {
                self.log_boot_status();
            }
            return Err(e);
        }
        Ok(())
    }

    fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.state
            .require(Phase::ProgramErase, "read requires P/E mode")?;
        self.leave_selection()?;

        self.link.send(Command::Read {
            area: self.read_area(address),
            address,
            len: buf.len() as u32,
        })?;
        let data = self
            .link
            .recv_data(commands::READ, commands::READ, SizeField::U32, buf.len())?;
        if data.len() != buf.len() {
            return Err(Error::Protocol(format!(
                "read returned {} bytes, requested {}",
                data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn end(&mut self) {
        if self.state.phase() == Phase::Ended {
            return;
        }
        if let Err(e) = self.leave_selection() {
            log::warn!("leaving selection failed: {}", e);
        }
        self.state.end();
        if let Err(e) = self.link.transport_mut().close() {
            log::warn!("closing transport failed: {}", e);
        }
    }
}
