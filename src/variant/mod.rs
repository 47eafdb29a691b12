//! Per-family protocol variants behind one capability interface.
use crate::constants::{CONNECT_ATTEMPTS, CONNECT_POLL_TIMEOUT, DEFAULT_TIMEOUT, GENERIC_CODE, SYNC_BYTE};
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, EraseStatus, MemoryArea, VerifyReport};

pub use self::family::{Family, Profile};
pub use self::framed::FramedSession;
pub use self::legacy::LegacySession;
pub use self::session::{BlankState, Phase, Selection, SessionState};

pub mod family;
mod framed;
mod legacy;
pub mod session;

/// Settings negotiated while binding to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOptions {
    /// Input oscillator in Hz.
    pub clock: u32,
    /// Multiplication ratio per internal clock, system clock first.
    pub multipliers: Vec<u8>,
    /// Requested bit rate, clamped to the family maximum.
    pub speed: u32,
    pub id: Option<[u8; 16]>,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions {
            clock: 12_000_000,
            multipliers: vec![8, 4],
            speed: 115_200,
            id: None,
        }
    }
}

/// Operations every family supports.
///
/// Calls must follow the session state machine: `connect`, `bind`, then any
/// mix of erase/write/read, then `end`.
pub trait Protocol {
    fn family(&self) -> Family;

    fn state(&self) -> &SessionState;

    /// Device reported by the boot program, once connected or bound.
    fn device(&self) -> Option<&DeviceDescriptor>;

    /// Synchronize with the boot program.
    fn connect(&mut self) -> Result<()>;

    /// Select device and clocks, query geometry, switch speed, enter P/E mode.
    fn bind(&mut self, opts: &BindOptions) -> Result<()>;

    /// Programming unit in bytes.
    fn page_size(&self) -> u32;

    /// Flash areas that may be programmed.
    fn areas(&self) -> Vec<MemoryArea>;

    /// Make sure the erase unit holding `address` is blank.
    fn erase_page(&mut self, address: u32) -> Result<EraseStatus>;

    /// Enter (`true`) or leave (`false`) write area selection.
    fn select_write_area(&mut self, select: bool) -> Result<()>;

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<()>;

    fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()>;

    fn verify_page(&mut self, address: u32, expected: &[u8]) -> Result<VerifyReport> {
        let mut actual = vec![0u8; expected.len()];
        self.read_page(address, &mut actual)?;
        Ok(VerifyReport::compare(address, expected, &actual))
    }

    /// Leave any selection and release the transport. Always succeeds.
    fn end(&mut self);
}

/// Send `0x00` until echoed, then `0x55` and check the family connection ID.
pub(crate) fn synchronize<T: Transport>(transport: &mut T, connection_id: u8) -> Result<()> {
    let mut buf = [0u8; 1];
    let mut synced = false;
    for attempt in 0..CONNECT_ATTEMPTS {
        transport.send_all(&[SYNC_BYTE])?;
        match transport.recv_exact(&mut buf, CONNECT_POLL_TIMEOUT) {
            Ok(()) if buf[0] == SYNC_BYTE => {
                log::debug!("synchronized after {} attempt(s)", attempt + 1);
                synced = true;
                break;
            }
            Ok(()) => log::debug!("ignoring 0x{:02X} while synchronizing", buf[0]),
            Err(Error::Timeout) => (),
            Err(e) => return Err(e),
        }
    }
    if !synced {
        log::error!("no answer from boot program after {} attempts", CONNECT_ATTEMPTS);
        return Err(Error::Timeout);
    }

    transport.send_all(&[GENERIC_CODE])?;
    transport.recv_exact(&mut buf, DEFAULT_TIMEOUT)?;
    if buf[0] != connection_id {
        return Err(Error::Protocol(format!(
            "connection ID 0x{:02X}, expected 0x{:02X}",
            buf[0], connection_id
        )));
    }
    Ok(())
}

/// One protocol implementation per family.
pub enum Variant<T: Transport> {
    Rx220(LegacySession<T>),
    Rx23x(LegacySession<T>),
    Rx24t(LegacySession<T>),
    Rx26t(FramedSession<T>),
    Rx62x(LegacySession<T>),
    Rx63x(LegacySession<T>),
    Rx64m(LegacySession<T>),
    Rx65x(LegacySession<T>),
    Rx66t(FramedSession<T>),
}

impl<T: Transport> Variant<T> {
    pub fn new(family: Family, transport: T) -> Self {
        let legacy = |transport| match family.profile() {
            Profile::Legacy(p) => LegacySession::new(family, p, transport),
            Profile::Framed(_) => unreachable!("{} is not a legacy family", family),
        };
        let framed = |transport| match family.profile() {
            Profile::Framed(p) => FramedSession::new(family, p, transport),
            Profile::Legacy(_) => unreachable!("{} is not a framed family", family),
        };
        match family {
            Family::Rx220 => Variant::Rx220(legacy(transport)),
            Family::Rx23x => Variant::Rx23x(legacy(transport)),
            Family::Rx24t => Variant::Rx24t(legacy(transport)),
            Family::Rx26t => Variant::Rx26t(framed(transport)),
            Family::Rx62x => Variant::Rx62x(legacy(transport)),
            Family::Rx63x => Variant::Rx63x(legacy(transport)),
            Family::Rx64m => Variant::Rx64m(legacy(transport)),
            Family::Rx65x => Variant::Rx65x(legacy(transport)),
            Family::Rx66t => Variant::Rx66t(framed(transport)),
        }
    }

    /// Select the variant from a device name known before connecting.
    pub fn for_device(name: &str, transport: T) -> Result<Self> {
        let family: Family = name.parse()?;
        log::info!("Device {} uses the {} protocol", name, family);
        Ok(Variant::new(family, transport))
    }
}

macro_rules! dispatch {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            Variant::Rx220($v) => $body,
            Variant::Rx23x($v) => $body,
            Variant::Rx24t($v) => $body,
            Variant::Rx26t($v) => $body,
            Variant::Rx62x($v) => $body,
            Variant::Rx63x($v) => $body,
            Variant::Rx64m($v) => $body,
            Variant::Rx65x($v) => $body,
            Variant::Rx66t($v) => $body,
        }
    };
}

impl<T: Transport> Protocol for Variant<T> {
    fn family(&self) -> Family {
        dispatch!(self, v => v.family())
    }

    fn state(&self) -> &SessionState {
        dispatch!(self, v => v.state())
    }

    fn device(&self) -> Option<&DeviceDescriptor> {
        dispatch!(self, v => v.device())
    }

    fn connect(&mut self) -> Result<()> {
        dispatch!(self, v => v.connect())
    }

    fn bind(&mut self, opts: &BindOptions) -> Result<()> {
        dispatch!(self, v => v.bind(opts))
    }

    fn page_size(&self) -> u32 {
        dispatch!(self, v => v.page_size())
    }

    fn areas(&self) -> Vec<MemoryArea> {
        dispatch!(self, v => v.areas())
    }

    fn erase_page(&mut self, address: u32) -> Result<EraseStatus> {
        dispatch!(self, v => v.erase_page(address))
    }

    fn select_write_area(&mut self, select: bool) -> Result<()> {
        dispatch!(self, v => v.select_write_area(select))
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        dispatch!(self, v => v.write_page(address, data))
    }

    fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        dispatch!(self, v => v.read_page(address, buf))
    }

    fn end(&mut self) {
        dispatch!(self, v => v.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn connection_without_echo_times_out() {
        let mut mock = MockTransport::new();
        assert!(matches!(synchronize(&mut mock, 0xe6), Err(Error::Timeout)));
        assert_eq!(mock.tx, vec![SYNC_BYTE; CONNECT_ATTEMPTS]);
    }

    #[test]
    fn connection_skips_noise_and_checks_id() {
        let mut mock = MockTransport::with_rx(&[0x55, 0x00, 0xe6]);
        synchronize(&mut mock, 0xe6).unwrap();
        assert_eq!(mock.tx, vec![0x00, 0x00, 0x55]);

        let mut mock = MockTransport::with_rx(&[0x00, 0xc3]);
        assert!(matches!(
            synchronize(&mut mock, 0xe6),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn variant_follows_device_name() {
        let v = Variant::for_device("RX72T", MockTransport::new()).unwrap();
        assert!(matches!(v, Variant::Rx66t(_)));
        assert_eq!(v.family(), Family::Rx66t);
        let v = Variant::for_device("RX220", MockTransport::new()).unwrap();
        assert_eq!(v.page_size(), 128);
        assert!(matches!(
            Variant::for_device("H8/3069", MockTransport::new()),
            Err(Error::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn every_family_builds_its_variant() {
        for family in Family::ALL {
            let v = Variant::new(family, MockTransport::new());
            assert_eq!(v.family(), family);
            assert_eq!(v.state().phase(), Phase::Disconnected);
        }
    }
}
