//! Framed boot mode session (RX26T, RX66T/RX72T).
use std::thread::sleep;

use super::family::{Family, FramedProfile};
use super::session::{BlankState, Phase, Selection, SessionState};
use super::{BindOptions, Protocol, synchronize};
use crate::constants::framed::{BAUD_SETTLE, MAX_READ_CHUNK, commands, errors};
use crate::error::{Error, Result};
use crate::protocol::framed::FramedLink;
use crate::transport::Transport;
use crate::types::{AreaInfo, DeviceDescriptor, DeviceType, EraseStatus, MemoryArea};

pub struct FramedSession<T> {
    family: Family,
    profile: &'static FramedProfile,
    link: FramedLink<T>,
    state: SessionState,
    device_type: Option<DeviceType>,
    device: Option<DeviceDescriptor>,
    areas: Vec<AreaInfo>,
    baud: u32,
}

fn range(start: u32, end: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&start.to_be_bytes());
    buf[4..].copy_from_slice(&end.to_be_bytes());
    buf
}

impl<T: Transport> FramedSession<T> {
    pub fn new(family: Family, profile: &'static FramedProfile, transport: T) -> Self {
        FramedSession {
            family,
            profile,
            link: FramedLink::new(transport),
            state: SessionState::new(),
            device_type: None,
            device: None,
            areas: Vec::new(),
            baud: crate::constants::INITIAL_BAUD,
        }
    }

    pub fn device_type(&self) -> Option<&DeviceType> {
        self.device_type.as_ref()
    }

    pub fn area_info(&self) -> &[AreaInfo] {
        &self.areas
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    fn set_frequency(&mut self, opts: &BindOptions) -> Result<()> {
        let ty = self
            .device_type
            .ok_or(Error::NotReady("device type not inquired"))?;
        if opts.clock < ty.osc_min || opts.clock > ty.osc_max {
            return Err(Error::InvalidParameter(format!(
                "input clock {} Hz outside {} - {} Hz",
                opts.clock, ty.osc_min, ty.osc_max
            )));
        }
        let ratio = opts.multipliers.first().copied().unwrap_or(1) as u32;
        let system = opts.clock.saturating_mul(ratio);
        if system < ty.sys_min || system > ty.sys_max {
            return Err(Error::InvalidParameter(format!(
                "system clock {} Hz outside {} - {} Hz",
                system, ty.sys_min, ty.sys_max
            )));
        }

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&opts.clock.to_be_bytes());
        payload[4..].copy_from_slice(&system.to_be_bytes());
        let frame = self.link.query(commands::FREQUENCY, &payload)?;
        log::debug!("operating frequency {}", hex::encode(&frame.payload));
        log::info!("Clock: input {} Hz, system {} Hz", opts.clock, system);
        Ok(())
    }

    fn inquire_areas(&mut self) -> Result<()> {
        self.areas.clear();
        for i in 0..self.profile.areas {
            let frame = self.link.query(commands::AREA_INFO, &[i])?;
            let info = AreaInfo::parse(&frame.payload)?;
            log::info!(
                "Area {}: {} erase {} write {}",
                info.kind,
                info.area,
                info.erase_unit,
                info.write_unit
            );
            self.areas.push(info);
        }
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
        self.link
            .transfer(commands::BIT_RATE, &speed.to_be_bytes())?;
        sleep(BAUD_SETTLE);
        self.link.transport_mut().change_baud(speed)?;
        self.baud = speed;
        self.link.transfer(commands::SYNC, &[])?;
        log::info!("Speed: {} baud", speed);
        self.state.advance(Phase::SpeedChanged)
    }

    /// Erase unit `(start, end)` holding `address`.
    fn erase_unit(&self, address: u32) -> Option<(u32, u32)> {
        self.areas.iter().find_map(|info| {
            let base = info.block().unit_base(address)?;
            Some((base, base + (info.erase_unit - 1)))
        })
    }

    /// Read `[start, end]` into `buf`, one data frame per status echo.
    fn read_range(&mut self, start: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = start
            .checked_add(buf.len() as u32 - 1)
            .ok_or_else(|| Error::InvalidParameter(format!("read past 0x{:08X}", start)))?;
        self.link
            .send_command(commands::READ, &range(start, end))?;
        let status = self.link.recv_status(commands::READ)?;

        let mut filled = 0;
        while filled < buf.len() {
            self.link.echo(&status)?;
            let frame = self.link.recv_frame()?.expect(commands::READ)?;
            let n = frame.payload.len();
            if n == 0 || n > MAX_READ_CHUNK || filled + n > buf.len() {
                return Err(Error::Protocol(format!(
                    "read data frame of {} bytes at offset {}",
                    n, filled
                )));
            }
            buf[filled..filled + n].copy_from_slice(&frame.payload);
            filled += n;
        }
        Ok(())
    }

    /// A protection error makes the rest of the session read-only.
    fn check_protection(&mut self, e: Error) -> Error {
        match e {
            Error::Device { code, .. }
                if code == errors::PROTECTION || code == errors::ID_MISMATCH =>
            {
                log::warn!("flash is ID protected (device error 0x{:02X})", code);
                self.state.id_protected = true;
                Error::IdProtected
            }
            e => e,
        }
    }

    fn is_blank(&mut self, start: u32, end: u32) -> Result<bool> {
        let mut buf = vec![0u8; (end - start) as usize + 1];
        self.read_range(start, &mut buf)?;
        Ok(buf.iter().all(|&b| b == crate::memory::FILL))
    }
}

impl<T: Transport> Protocol for FramedSession<T> {
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

        let frame = self.link.query(commands::DEVICE_TYPE, &[])?;
        let ty = DeviceType::parse(&frame.payload)?;
        log::info!("Connected to {} boot program, {}", self.family, ty);
        self.device = Some(ty.descriptor());
        self.device_type = Some(ty);
        self.state.advance(Phase::Connected)
    }

    fn bind(&mut self, opts: &BindOptions) -> Result<()> {
        self.state
            .require(Phase::Connected, "bind requires a connected session")?;
        self.link
            .transfer(commands::ENDIAN, &[self.profile.endian])?;
        self.set_frequency(opts)?;
        self.state.advance(Phase::DeviceSelected)?;
        self.inquire_areas()?;
        self.change_speed(opts)?;
        if let Some(id) = opts.id {
            self.link.transfer(commands::ID_AUTH, &id)?;
            log::info!("ID authentication: ok");
        }
        self.state.advance(Phase::ProgramErase)
    }

    fn page_size(&self) -> u32 {
        self.profile.page_size
    }

    fn areas(&self) -> Vec<MemoryArea> {
        self.areas.iter().map(|info| info.area).collect()
    }

    fn erase_page(&mut self, address: u32) -> Result<EraseStatus> {
        self.state.require_writable("erase requires P/E mode")?;
        if self.state.blank == BlankState::NotChecked {
            self.state.blank = BlankState::NotBlank;
        }

        let (start, end) = self.erase_unit(address).ok_or_else(|| {
            Error::InvalidParameter(format!("0x{:08X} is outside every flash area", address))
        })?;
        if self.state.is_erased(start) {
            return Ok(EraseStatus::CheckOk);
        }
        if self.is_blank(start, end)? {
            log::debug!("unit 0x{:08X} already blank", start);
            self.state.mark_erased(start);
            return Ok(EraseStatus::CheckOk);
        }

        match self.link.transfer(commands::ERASE, &range(start, end)) {
            Ok(_) => (),
            Err(Error::Device { code, .. }) if code == errors::ALREADY_BLANK => {
                self.state.mark_erased(start);
                return Ok(EraseStatus::CheckOk);
            }
            Err(e) => return Err(self.check_protection(e)),
        }
        log::debug!("erased unit 0x{:08X}", start);
        self.state.mark_erased(start);
        Ok(EraseStatus::EraseOk)
    }

    fn select_write_area(&mut self, select: bool) -> Result<()> {
        if !select {
            if self.state.selection == Selection::WriteArea {
                self.state.selection = Selection::Idle;
            }
            return Ok(());
        }
        self.state.require_writable("write requires P/E mode")?;
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
        let page = self.profile.page_size;
        if data.len() != page as usize || address % page != 0 {
            return Err(Error::InvalidParameter(format!(
                "page 0x{:08X}+{} is not a {} byte aligned page",
                address,
                data.len(),
                page
            )));
        }

        let end = address + (page - 1);
        let result = self
            .link
            .transfer(commands::WRITE, &range(address, end))
            .and_then(|_| self.link.send_data(commands::WRITE, data))
            .and_then(|_| self.link.recv_status(commands::WRITE));
        if let Err(e) = result {
            if let Error::Device { code, .. } = &e {
                log::warn!("write at 0x{:08X} failed with device error 0x{:02X}", address, code);
            }
            self.state.write_failed = true;
            return Err(self.check_protection(e));
        }
        Ok(())
    }

    fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.state
            .require(Phase::ProgramErase, "read requires P/E mode")?;
        self.read_range(address, buf)
    }

    fn end(&mut self) {
        if self.state.phase() == Phase::Ended {
            return;
        }
        self.state.end();
        if let Err(e) = self.link.transport_mut().close() {
            log::warn!("closing transport failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::framed::{CONNECTION_ID, SOD, SOH};
    use crate::protocol::framed::encode;
    use crate::transport::mock::MockTransport;
    use crate::variant::Profile;

    fn status(op: u8) -> Vec<u8> {
        encode(SOD, op, &[0x00])
    }

    fn device_type() -> Vec<u8> {
        let mut raw = b"R5F572TK".to_vec();
        for v in [24_000_000u32, 8_000_000, 200_000_000, 2_000_000] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        raw
    }

    fn area(kind: u8, start: u32, end: u32, eau: u32, wau: u32) -> Vec<u8> {
        let mut raw = vec![kind];
        for v in [start, end, eau, wau] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        raw
    }

    /// Device side of connect plus bind without ID authentication.
    fn bind_script() -> Vec<u8> {
        let mut rx = vec![0x00, CONNECTION_ID];
        rx.extend(encode(SOD, 0x38, &device_type()));
        rx.extend(status(0x36));
        rx.extend(encode(SOD, 0x32, &[0x05, 0xf5, 0xe1, 0x00, 0x02, 0xfa, 0xf0, 0x80]));
        rx.extend(encode(SOD, 0x3b, &area(0, 0xfff8_0000, 0xffff_ffff, 0x8000, 0x100)));
        rx.extend(encode(SOD, 0x3b, &area(1, 0x0010_0000, 0x0010_7fff, 0x40, 0x4)));
        rx.extend(status(0x34));
        rx.extend(status(0x00));
        rx
    }

    fn bound() -> FramedSession<MockTransport> {
        let Profile::Framed(profile) = Family::Rx66t.profile() else {
            unreachable!()
        };
        let mut session =
            FramedSession::new(Family::Rx66t, profile, MockTransport::with_rx(&bind_script()));
        session.connect().unwrap();
        session.bind(&BindOptions::default()).unwrap();
        session.link.transport_mut().take_tx();
        session
    }

    fn mock(session: &mut FramedSession<MockTransport>) -> &mut MockTransport {
        session.link.transport_mut()
    }

    /// Device answer to a read of `data`, including the leading status.
    fn read_reply(data: &[u8]) -> Vec<u8> {
        let mut rx = status(0x15);
        for chunk in data.chunks(MAX_READ_CHUNK) {
            rx.extend(encode(SOD, 0x15, chunk));
        }
        rx
    }

    #[test]
    fn bind_transcript() {
        let Profile::Framed(profile) = Family::Rx66t.profile() else {
            unreachable!()
        };
        let mut session =
            FramedSession::new(Family::Rx66t, profile, MockTransport::with_rx(&bind_script()));
        session.connect().unwrap();
        assert_eq!(session.device_type().unwrap().osc_min, 8_000_000);
        assert_eq!(session.state().phase(), Phase::Connected);
        session
            .bind(&BindOptions {
                speed: 2_000_000,
                ..BindOptions::default()
            })
            .unwrap();

        let mut expected = vec![0x00, 0x55];
        expected.extend(encode(SOH, 0x38, &[]));
        expected.extend(encode(SOH, 0x36, &[0x01]));
        expected.extend(encode(SOH, 0x32, &[0x00, 0xb7, 0x1b, 0x00, 0x05, 0xb8, 0xd8, 0x00]));
        expected.extend(encode(SOH, 0x3b, &[0x00]));
        expected.extend(encode(SOH, 0x3b, &[0x01]));
        expected.extend(encode(SOH, 0x34, &1_500_000u32.to_be_bytes()));
        expected.extend(encode(SOH, 0x00, &[]));
        assert_eq!(mock(&mut session).take_tx(), expected);
        assert_eq!(mock(&mut session).bauds, vec![1_500_000]);
        assert_eq!(session.state().phase(), Phase::ProgramErase);
        assert_eq!(session.areas().len(), 2);
    }

    #[test]
    fn device_type_inquiry_is_mandatory() {
        let Profile::Framed(profile) = Family::Rx26t.profile() else {
            unreachable!()
        };
        let mut session = FramedSession::new(
            Family::Rx26t,
            profile,
            MockTransport::with_rx(&[0x00, CONNECTION_ID]),
        );
        assert!(matches!(session.connect(), Err(Error::Timeout)));
        assert_eq!(session.state().phase(), Phase::Disconnected);
    }

    #[test]
    fn clock_outside_device_range_is_rejected() {
        let Profile::Framed(profile) = Family::Rx66t.profile() else {
            unreachable!()
        };
        let mut session =
            FramedSession::new(Family::Rx66t, profile, MockTransport::with_rx(&bind_script()));
        session.connect().unwrap();
        let opts = BindOptions {
            clock: 48_000_000,
            ..BindOptions::default()
        };
        assert!(matches!(session.bind(&opts), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn erase_checks_unit_then_erases_once() {
        let mut session = bound();
        let mut dirty = vec![0xffu8; 0x40];
        dirty[3] = 0x00;
        let mut rx = read_reply(&dirty);
        rx.extend(status(0x12));
        mock(&mut session).push_rx(&rx);

        assert_eq!(session.erase_page(0x0010_0000).unwrap(), EraseStatus::EraseOk);
        let tx = mock(&mut session).take_tx();
        let mut expected = encode(SOH, 0x15, &range(0x0010_0000, 0x0010_003f));
        expected.extend(status(0x15));
        expected.extend(encode(SOH, 0x12, &range(0x0010_0000, 0x0010_003f)));
        assert_eq!(tx, expected);

        assert_eq!(session.erase_page(0x0010_0020).unwrap(), EraseStatus::CheckOk);
        assert!(mock(&mut session).tx.is_empty());
    }

    #[test]
    fn blank_unit_is_not_erased() {
        let mut session = bound();
        mock(&mut session).push_rx(&read_reply(&[0xff; 0x40]));
        assert_eq!(session.erase_page(0x0010_0040).unwrap(), EraseStatus::CheckOk);
        assert!(session.state().is_erased(0x0010_0040));

        let mut expected = encode(SOH, 0x15, &range(0x0010_0040, 0x0010_007f));
        expected.extend(status(0x15));
        let tx = mock(&mut session).take_tx();
        assert_eq!(tx, expected);
        let erase = encode(SOH, 0x12, &range(0x0010_0040, 0x0010_007f));
        assert!(!tx.windows(erase.len()).any(|w| w == &erase[..]));
    }

    #[test]
    fn protection_error_makes_session_read_only() {
        let mut session = bound();
        let mut rx = read_reply(&[0x00; 0x40]);
        rx.extend(encode(SOD, 0x92, &[errors::PROTECTION]));
        mock(&mut session).push_rx(&rx);
        assert!(matches!(
            session.erase_page(0x0010_0000),
            Err(Error::IdProtected)
        ));
        assert!(session.state().id_protected);

        mock(&mut session).take_tx();
        assert!(matches!(
            session.erase_page(0x0010_0040),
            Err(Error::IdProtected)
        ));
        assert!(matches!(
            session.select_write_area(true),
            Err(Error::IdProtected)
        ));
        assert!(mock(&mut session).tx.is_empty());

        mock(&mut session).push_rx(&read_reply(&[0x5a; 0x10]));
        let mut buf = [0u8; 0x10];
        session.read_page(0x0010_0000, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 0x10]);
    }

    #[test]
    fn id_mismatch_on_write_is_id_protected() {
        let mut session = bound();
        session.select_write_area(true).unwrap();
        let mut rx = status(0x13);
        rx.extend(encode(SOD, 0x93, &[errors::ID_MISMATCH]));
        mock(&mut session).push_rx(&rx);
        assert!(matches!(
            session.write_page(0xfff8_0000, &[0u8; 256]),
            Err(Error::IdProtected)
        ));
        assert!(session.state().id_protected);
    }

    #[test]
    fn already_blank_error_is_check_ok() {
        let mut session = bound();
        let mut rx = read_reply(&[0x00; 0x40]);
        rx.extend(encode(SOD, 0x92, &[errors::ALREADY_BLANK]));
        mock(&mut session).push_rx(&rx);
        assert_eq!(session.erase_page(0x0010_0080).unwrap(), EraseStatus::CheckOk);

        let mut rx = read_reply(&[0x00; 0x40]);
        rx.extend(encode(SOD, 0x92, &[errors::ERASE]));
        mock(&mut session).push_rx(&rx);
        assert!(matches!(
            session.erase_page(0x0010_00c0),
            Err(Error::Device { command: 0x12, code: 0xe1 })
        ));
    }

    #[test]
    fn large_unit_read_spans_frames() {
        let mut session = bound();
        let mut rx = read_reply(&[0xff; 0x8000]);
        rx.extend(status(0x12));
        mock(&mut session).push_rx(&rx);
        assert_eq!(session.erase_page(0xfff8_0000).unwrap(), EraseStatus::CheckOk);
        let tx = mock(&mut session).take_tx();
        let echo = status(0x15);
        let echoes = tx.windows(echo.len()).filter(|w| *w == &echo[..]).count();
        assert_eq!(echoes, 0x8000 / MAX_READ_CHUNK);
        assert_eq!(mock(&mut session).rx.len(), status(0x12).len());
    }

    #[test]
    fn write_page_transcript() {
        let mut session = bound();
        let data: Vec<u8> = (0..=255u8).collect();
        let mut rx = status(0x13);
        rx.extend(status(0x13));
        mock(&mut session).push_rx(&rx);

        assert!(matches!(
            session.write_page(0xfff8_0000, &data),
            Err(Error::NotReady(_))
        ));
        session.select_write_area(true).unwrap();
        session.write_page(0xfff8_0100, &data).unwrap();

        let mut expected = encode(SOH, 0x13, &range(0xfff8_0100, 0xfff8_01ff));
        expected.extend(encode(SOD, 0x13, &data));
        assert_eq!(mock(&mut session).take_tx(), expected);
    }

    #[test]
    fn failed_write_blocks_further_writes() {
        let mut session = bound();
        let mut rx = status(0x13);
        rx.extend(encode(SOD, 0x93, &[errors::WRITE]));
        mock(&mut session).push_rx(&rx);
        session.select_write_area(true).unwrap();
        assert!(matches!(
            session.write_page(0xfff8_0000, &[0u8; 256]),
            Err(Error::Device { command: 0x13, code: 0xe2 })
        ));
        assert!(matches!(
            session.write_page(0xfff8_0100, &[0u8; 256]),
            Err(Error::NotReady(_))
        ));
        session.select_write_area(true).unwrap();
        assert!(!session.state().write_failed);
    }

    #[test]
    fn read_page_echoes_status() {
        let mut session = bound();
        let data: Vec<u8> = (0..=255u8).rev().collect();
        mock(&mut session).push_rx(&read_reply(&data));
        let mut buf = vec![0u8; 256];
        session.read_page(0xfff8_0000, &mut buf).unwrap();
        assert_eq!(buf, data);

        let mut expected = encode(SOH, 0x15, &range(0xfff8_0000, 0xfff8_00ff));
        expected.extend(status(0x15));
        assert_eq!(mock(&mut session).take_tx(), expected);
    }

    #[test]
    fn id_authentication_is_sent() {
        let Profile::Framed(profile) = Family::Rx66t.profile() else {
            unreachable!()
        };
        let mut rx = bind_script();
        rx.extend(status(0x30));
        let mut session = FramedSession::new(Family::Rx66t, profile, MockTransport::with_rx(&rx));
        session.connect().unwrap();
        let id = [0x11u8; 16];
        session
            .bind(&BindOptions {
                id: Some(id),
                ..BindOptions::default()
            })
            .unwrap();
        assert!(mock(&mut session).take_tx().ends_with(&encode(SOH, 0x30, &id)));
    }
}
