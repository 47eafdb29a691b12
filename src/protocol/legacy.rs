//! Fixed-field boot mode grammar of the RX600/RX200 families.
//!
//! Requests are `opcode [size] fields checksum`, answers are either a single
//! ACK byte, a tagged data response or `opcode | 0x80` plus an error code.

use std::time::Duration;

use scroll::{BE, Pread, Pwrite};

use crate::constants::{
    DEFAULT_TIMEOUT,
    legacy::{ACK, ERROR_FLAG, RESPONSE_FLAG, WRITE_CHUNK, commands},
};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// `256 - (sum mod 256)`, so that the sum over the frame including the
/// checksum is zero.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Erase unit selector, the addressing depends on the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EraseTarget {
    Block(u8),
    Address(u32),
    BlockEnd,
    AddressEnd,
}

/// Legacy boot mode request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Opcode-only request: inquiries, selections, P/E transition, blank check.
    Inquiry(u8),
    DeviceSelect { code: u32 },
    ClockModeSelect { mode: u8 },
    /// `bit_rate` in bps/100, `clock` in 0.01 MHz.
    BitRate {
        bit_rate: u16,
        clock: u16,
        multipliers: Vec<u8>,
    },
    IdCodeCheck { id: [u8; 16] },
    BlockErase(EraseTarget),
    /// Program one page. Sent without a size field.
    Program { address: u32, data: Vec<u8> },
    /// Terminates write selection.
    ProgramEnd,
    Read { area: u8, address: u32, len: u32 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Inquiry(op) => *op,
            Command::DeviceSelect { .. } => commands::DEVICE_SELECT,
            Command::ClockModeSelect { .. } => commands::CLOCK_MODE_SELECT,
            Command::BitRate { .. } => commands::BIT_RATE,
            Command::IdCodeCheck { .. } => commands::ID_CODE_CHECK,
            Command::BlockErase(_) => commands::BLOCK_ERASE,
            Command::Program { .. } | Command::ProgramEnd => commands::PROGRAM,
            Command::Read { .. } => commands::READ,
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        let opcode = self.opcode();
        let mut buf = match self {
            Command::Inquiry(op) => return Ok(vec![op]),
            Command::DeviceSelect { code } => {
                let mut buf = vec![opcode, 4, 0, 0, 0, 0];
                buf.pwrite_with(code, 2, BE)?;
                buf
            }
            Command::ClockModeSelect { mode } => vec![opcode, 1, mode],
            Command::BitRate {
                bit_rate,
                clock,
                multipliers,
            } => {
                let mut buf = vec![0u8; 2 + 2 + 2 + 1];
                buf[0] = opcode;
                buf[1] = (5 + multipliers.len()) as u8;
                buf.pwrite_with(bit_rate, 2, BE)?;
                buf.pwrite_with(clock, 4, BE)?;
                buf[6] = multipliers.len() as u8;
                buf.extend_from_slice(&multipliers);
                buf
            }
            Command::IdCodeCheck { id } => {
                let mut buf = vec![opcode, id.len() as u8];
                buf.extend_from_slice(&id);
                buf
            }
            Command::BlockErase(target) => match target {
                EraseTarget::Block(n) => vec![opcode, 1, n],
                EraseTarget::BlockEnd => vec![opcode, 1, 0xff],
                EraseTarget::Address(address) => {
                    let mut buf = vec![opcode, 4, 0, 0, 0, 0];
                    buf.pwrite_with(address, 2, BE)?;
                    buf
                }
                EraseTarget::AddressEnd => vec![opcode, 4, 0xff, 0xff, 0xff, 0xff],
            },
            Command::Program { address, data } => {
                let mut buf = vec![0u8; 5 + data.len()];
                buf[0] = opcode;
                buf.pwrite_with(address, 1, BE)?;
                buf[5..].copy_from_slice(&data);
                buf
            }
            Command::ProgramEnd => vec![opcode, 0xff, 0xff, 0xff, 0xff],
            Command::Read { area, address, len } => {
                let mut buf = vec![0u8; 2 + 1 + 4 + 4];
                buf[0] = opcode;
                buf[1] = 9;
                buf[2] = area;
                buf.pwrite_with(address, 3, BE)?;
                buf.pwrite_with(len, 7, BE)?;
                buf
            }
        };
        buf.push(checksum(&buf));
        Ok(buf)
    }
}

/// Largest inquiry response accepted.
const INQUIRY_MAX: usize = 0xffff;

/// Width of the size field of a data response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeField {
    U8,
    U16,
    U32,
}

impl SizeField {
    fn width(self) -> usize {
        match self {
            SizeField::U8 => 1,
            SizeField::U16 => 2,
            SizeField::U32 => 4,
        }
    }
}

/// Legacy frame codec on top of a transport.
pub struct LegacyLink<T> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> LegacyLink<T> {
    pub fn new(transport: T) -> Self {
        LegacyLink {
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.transport.send_all(&[byte])
    }

    pub fn recv_byte(&mut self, timeout: Duration) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.transport.recv_exact(&mut buf, timeout)?;
        Ok(buf[0])
    }

    pub fn send(&mut self, cmd: Command) -> Result<()> {
        let req = cmd.into_raw()?;
        log::debug!("=> {}", hex::encode(&req));
        self.transport.send_all(&req)
    }

    /// Send a program command split into hardware buffer sized pieces: the
    /// header, the payload in 16-byte chunks, then the checksum byte.
    pub fn send_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let req = Command::Program {
            address,
            data: data.to_vec(),
        }
        .into_raw()?;
        log::debug!("=> {}", hex::encode(&req));
        let (header, rest) = req.split_at(5);
        let (payload, sum) = rest.split_at(rest.len() - 1);
        self.transport.send_all(header)?;
        for chunk in payload.chunks(WRITE_CHUNK) {
            self.transport.send_all(chunk)?;
        }
        self.transport.send_all(sum)
    }

    /// Read a one byte reply to `opcode`. An `opcode | 0x80` tag and the
    /// error code following it turn into [`Error::Device`].
    pub fn recv_reply(&mut self, opcode: u8) -> Result<u8> {
        let tag = self.recv_byte(self.timeout)?;
        log::debug!("<= {:02x}", tag);
        if tag == opcode | ERROR_FLAG {
            return Err(self.recv_error(opcode)?);
        }
        Ok(tag)
    }

    /// Expect a bare ACK for `opcode`.
    pub fn recv_ack(&mut self, opcode: u8) -> Result<()> {
        match self.recv_reply(opcode)? {
            ACK => Ok(()),
            t => Err(Error::Protocol(format!(
                "unexpected response 0x{:02X} to command 0x{:02X}",
                t, opcode
            ))),
        }
    }

    /// Issue a command and expect an ACK.
    pub fn transfer_ack(&mut self, cmd: Command) -> Result<()> {
        let opcode = cmd.opcode();
        self.send(cmd)?;
        self.recv_ack(opcode)
    }

    /// Issue an opcode-only inquiry and read its `op | 0x10` tagged response.
    pub fn inquire(&mut self, opcode: u8, size: SizeField) -> Result<Vec<u8>> {
        self.send(Command::Inquiry(opcode))?;
        self.recv_data(opcode, opcode | RESPONSE_FLAG, size, INQUIRY_MAX)
    }

    /// Read a tagged data response `tag size data sum` carrying at most `max`
    /// data bytes.
    pub fn recv_data(
        &mut self,
        opcode: u8,
        tag: u8,
        size: SizeField,
        max: usize,
    ) -> Result<Vec<u8>> {
        let head = self.recv_byte(self.timeout)?;
        if head == opcode | ERROR_FLAG {
            return Err(self.recv_error(opcode)?);
        }
        if head != tag {
            return Err(Error::Protocol(format!(
                "response tag 0x{:02X} does not match 0x{:02X}",
                head, tag
            )));
        }

        let mut len_buf = [0u8; 4];
        let width = size.width();
        self.transport
            .recv_exact(&mut len_buf[..width], self.timeout)?;
        let len = match size {
            SizeField::U8 => len_buf[0] as usize,
            SizeField::U16 => len_buf.pread_with::<u16>(0, BE)? as usize,
            SizeField::U32 => len_buf.pread_with::<u32>(0, BE)? as usize,
        };
        if len > max {
            return Err(Error::Frame(format!(
                "declared length {} exceeds {} bytes",
                len, max
            )));
        }

        let mut body = vec![0u8; len + 1];
        self.transport.recv_exact(&mut body, self.timeout)?;

        let mut raw = Vec::with_capacity(1 + width + body.len());
        raw.push(head);
        raw.extend_from_slice(&len_buf[..width]);
        raw.extend_from_slice(&body);
        log::debug!("<= {}", hex::encode(&raw));

        let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            let actual = body[len];
            return Err(Error::Checksum {
                expected: checksum(&raw[..raw.len() - 1]),
                actual,
            });
        }
        body.truncate(len);
        Ok(body)
    }

    fn recv_error(&mut self, opcode: u8) -> Result<Error> {
        let code = self.recv_byte(self.timeout)?;
        log::debug!("<= {:02x} (error code)", code);
        Ok(Error::Device {
            command: opcode,
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, TricklingTransport};

    fn framed(mut body: Vec<u8>) -> Vec<u8> {
        body.push(checksum(&body));
        body
    }

    #[test]
    fn checksum_makes_frame_sum_zero() {
        let frame = framed(vec![0x10, 0x04, 0x12, 0x34, 0x56, 0x78]);
        let sum = frame.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        assert_eq!(sum, 0);
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xff);
    }

    #[test]
    fn device_select_is_big_endian() {
        let raw = Command::DeviceSelect { code: 0x3532_3130 }.into_raw().unwrap();
        assert_eq!(raw, framed(vec![0x10, 0x04, 0x35, 0x32, 0x31, 0x30]));
    }

    #[test]
    fn bit_rate_field_order() {
        let raw = Command::BitRate {
            bit_rate: 1152,
            clock: 1200,
            multipliers: vec![8, 4],
        }
        .into_raw()
        .unwrap();
        assert_eq!(
            raw,
            framed(vec![0x3f, 0x07, 0x04, 0x80, 0x04, 0xb0, 0x02, 0x08, 0x04])
        );
    }

    #[test]
    fn read_and_erase_commands() {
        let raw = Command::Read {
            area: 0x01,
            address: 0xfff8_0000,
            len: 0x100,
        }
        .into_raw()
        .unwrap();
        assert_eq!(
            raw,
            framed(vec![
                0x52, 0x09, 0x01, 0xff, 0xf8, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00
            ])
        );
        let raw = Command::BlockErase(EraseTarget::Block(3)).into_raw().unwrap();
        assert_eq!(raw, framed(vec![0x58, 0x01, 0x03]));
        let raw = Command::BlockErase(EraseTarget::AddressEnd)
            .into_raw()
            .unwrap();
        assert_eq!(raw, framed(vec![0x58, 0x04, 0xff, 0xff, 0xff, 0xff]));
        let raw = Command::ProgramEnd.into_raw().unwrap();
        assert_eq!(raw, framed(vec![0x50, 0xff, 0xff, 0xff, 0xff]));
    }

    #[test]
    fn program_is_sent_in_chunks() {
        let mut link = LegacyLink::new(MockTransport::new());
        let data: Vec<u8> = (0..=255u8).collect();
        link.send_program(0xffff_ff00, &data).unwrap();
        let tx = link.transport_mut().take_tx();
        assert_eq!(tx.len(), 5 + 256 + 1);
        assert_eq!(&tx[..5], &[0x50, 0xff, 0xff, 0xff, 0x00]);
        assert_eq!(&tx[5..261], &data[..]);
        assert_eq!(tx.iter().fold(0u8, |a, &b| a.wrapping_add(b)), 0);
    }

    #[test]
    fn recv_data_checks_tag_and_sum() {
        let resp = framed(vec![0x37, 0x02, 0x01, 0x00]);
        let mut link = LegacyLink::new(MockTransport::with_rx(&resp));
        let data = link.recv_data(0x27, 0x37, SizeField::U8, 256).unwrap();
        assert_eq!(data, vec![0x01, 0x00]);

        let mut bad = resp.clone();
        bad[2] ^= 0x01;
        let mut link = LegacyLink::new(MockTransport::with_rx(&bad));
        assert!(matches!(
            link.recv_data(0x27, 0x37, SizeField::U8, 256),
            Err(Error::Checksum { .. })
        ));

        let mut link = LegacyLink::new(MockTransport::with_rx(&[0x36, 0x00, 0xca]));
        assert!(matches!(
            link.recv_data(0x27, 0x37, SizeField::U8, 256),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn recv_data_rejects_any_flipped_byte() {
        let resp = framed(vec![0x52, 0x00, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        for i in 5..resp.len() {
            for bit in 0..8 {
                let mut bad = resp.clone();
                bad[i] ^= 1 << bit;
                let mut link = LegacyLink::new(MockTransport::with_rx(&bad));
                assert!(
                    link.recv_data(0x52, 0x52, SizeField::U32, 256).is_err(),
                    "flip of byte {} bit {} accepted",
                    i,
                    bit
                );
            }
        }
    }

    #[test]
    fn recv_data_rejects_oversized_length() {
        let mut link = LegacyLink::new(MockTransport::with_rx(&[0x52, 0xff, 0xff, 0xff, 0xff]));
        match link.recv_data(0x52, 0x52, SizeField::U32, 256) {
            Err(e @ Error::Frame(_)) => assert!(!e.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wide_size_field_with_partial_reads() {
        let resp = framed(vec![0x36, 0x00, 0x03, 0x01, 0x02, 0x03]);
        let mut link = LegacyLink::new(TricklingTransport {
            inner: MockTransport::with_rx(&resp),
            slice: 1,
        });
        assert_eq!(
            link.recv_data(0x26, 0x36, SizeField::U16, 256).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn error_response_carries_code() {
        let mut link = LegacyLink::new(MockTransport::with_rx(&[0xd0, 0x2a]));
        match link.recv_ack(0x50) {
            Err(Error::Device { command, code }) => {
                assert_eq!(command, 0x50);
                assert_eq!(code, 0x2a);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_response_is_timeout() {
        let mut link = LegacyLink::new(MockTransport::new());
        assert!(matches!(link.recv_ack(0x10), Err(Error::Timeout)));
    }
}
