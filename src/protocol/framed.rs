//! SOH/ETX delimited grammar of the newer RX families.
//!
//! `head(SOH|SOD) length(2, BE) opcode payload checksum ETX`, where `length`
//! counts the opcode and payload, and the checksum covers `length..payload`.

use std::fmt;
use std::time::{Duration, Instant};

use scroll::{BE, Pread};

use crate::constants::{
    DEFAULT_TIMEOUT,
    framed::{ERROR_FLAG, ETX, SOD, SOH, STATUS_OK},
};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Two's complement of the byte sum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Build a frame with the given head tag.
pub fn encode(head: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u16;
    let mut buf = Vec::with_capacity(payload.len() + 6);
    buf.push(head);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(opcode);
    buf.extend_from_slice(payload);
    buf.push(checksum(&buf[1..]));
    buf.push(ETX);
    buf
}

/// A received frame, keeping the exact wire bytes for status-back echoes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
    raw: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:02x})[{}]", self.opcode, hex::encode(&self.payload))
    }
}

impl Frame {
    /// Parse one complete frame sent by the device.
    pub fn decode(raw: &[u8]) -> Result<Frame> {
        if raw.len() < 6 {
            return Err(Error::Frame(format!("frame too short: {} bytes", raw.len())));
        }
        if raw[0] != SOD {
            return Err(Error::Frame(format!("bad header tag 0x{:02X}", raw[0])));
        }
        let len = raw.pread_with::<u16>(1, BE)? as usize;
        if len == 0 || raw.len() != len + 5 {
            return Err(Error::Frame(format!(
                "declared length {} does not match frame of {} bytes",
                len,
                raw.len()
            )));
        }
        let sum_at = 3 + len;
        let expected = checksum(&raw[1..sum_at]);
        if raw[sum_at] != expected {
            return Err(Error::Checksum {
                expected,
                actual: raw[sum_at],
            });
        }
        if raw[sum_at + 1] != ETX {
            return Err(Error::Frame(format!(
                "bad trailer 0x{:02X}",
                raw[sum_at + 1]
            )));
        }
        Ok(Frame {
            opcode: raw[3],
            payload: raw[4..sum_at].to_vec(),
            raw: raw.to_vec(),
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_error(&self) -> bool {
        self.opcode & ERROR_FLAG != 0
    }

    /// Status code of a status frame.
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Accept this frame as the answer to `opcode`, turning an error status
    /// into [`Error::Device`].
    pub fn expect(self, opcode: u8) -> Result<Frame> {
        if self.opcode == opcode {
            Ok(self)
        } else if self.opcode == opcode | ERROR_FLAG {
            let code = self.status().unwrap_or(0);
            log::debug!("device error 0x{:02X} for command 0x{:02X}", code, opcode);
            Err(Error::Device {
                command: opcode,
                code,
            })
        } else {
            Err(Error::Protocol(format!(
                "response opcode 0x{:02X} does not match 0x{:02X}",
                self.opcode, opcode
            )))
        }
    }
}

/// Framed codec on top of a transport.
pub struct FramedLink<T> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> FramedLink<T> {
    pub fn new(transport: T) -> Self {
        FramedLink {
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

    /// Send a command frame (`SOH`).
    pub fn send_command(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let req = encode(SOH, opcode, payload);
        log::debug!("=> {}", hex::encode(&req));
        self.transport.send_all(&req)
    }

    /// Send a data frame (`SOD`).
    pub fn send_data(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let req = encode(SOD, opcode, payload);
        log::debug!("=> {}", hex::encode(&req));
        self.transport.send_all(&req)
    }

    /// Echo a received status frame byte for byte.
    pub fn echo(&mut self, frame: &Frame) -> Result<()> {
        log::debug!("=> {}", hex::encode(frame.raw()));
        self.transport.send_all(frame.raw())
    }

    /// Receive one `SOD` frame.
    pub fn recv_frame(&mut self) -> Result<Frame> {
        let mut head = [0u8; 3];
        self.transport.recv_exact(&mut head, self.timeout)?;
        if head[0] != SOD {
            return Err(Error::Frame(format!("bad header tag 0x{:02X}", head[0])));
        }
        let len = head.pread_with::<u16>(1, BE)? as usize;
        if len == 0 {
            return Err(Error::Frame("zero frame length".into()));
        }
        let mut raw = vec![0u8; 3 + len + 2];
        raw[..3].copy_from_slice(&head);
        let got = self.recv_body(&mut raw[3..])?;
        if got < len + 2 {
            return Err(Error::Frame(format!(
                "declared length {}, got {} of {} body bytes",
                len,
                got,
                len + 2
            )));
        }
        log::debug!("<= {}", hex::encode(&raw));
        Frame::decode(&raw)
    }

    /// Collect the frame body, returns how much arrived before the window
    /// closed.
    fn recv_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = self.transport.recv(&mut buf[filled..], remaining)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Receive the status frame answering `opcode`.
    pub fn recv_status(&mut self, opcode: u8) -> Result<Frame> {
        let frame = self.recv_frame()?.expect(opcode)?;
        match frame.status() {
            Some(STATUS_OK) | None => Ok(frame),
            Some(code) => Err(Error::Device {
                command: opcode,
                code,
            }),
        }
    }

    /// Send a command and wait for its status.
    pub fn transfer(&mut self, opcode: u8, payload: &[u8]) -> Result<Frame> {
        self.send_command(opcode, payload)?;
        self.recv_status(opcode)
    }

    /// Send a command and wait for its data response.
    pub fn query(&mut self, opcode: u8, payload: &[u8]) -> Result<Frame> {
        self.send_command(opcode, payload)?;
        self.recv_frame()?.expect(opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, TricklingTransport};

    #[test]
    fn encode_sync_command() {
        assert_eq!(encode(SOH, 0x00, &[]), vec![0x01, 0x00, 0x01, 0x00, 0xff, 0x03]);
        assert_eq!(
            encode(SOD, 0x34, &[0x00]),
            vec![0x81, 0x00, 0x02, 0x34, 0x00, 0xca, 0x03]
        );
    }

    #[test]
    fn decode_roundtrips_payload() {
        let raw = encode(SOD, 0x15, &[1, 2, 3, 4]);
        let frame = Frame::decode(&raw).unwrap();
        assert_eq!(frame.opcode, 0x15);
        assert_eq!(frame.payload, vec![1, 2, 3, 4]);
        assert_eq!(frame.raw(), &raw[..]);
    }

    #[test]
    fn every_single_byte_corruption_is_rejected() {
        let raw = encode(SOD, 0x38, &[0x52, 0x35, 0x46, 0x35, 0x37, 0x32, 0x54, 0x00]);
        for i in 0..raw.len() {
            for flip in 1..=255u8 {
                let mut bad = raw.clone();
                bad[i] ^= flip;
                assert!(
                    Frame::decode(&bad).is_err(),
                    "corruption 0x{:02x} at byte {} accepted",
                    flip,
                    i
                );
            }
        }
    }

    #[test]
    fn checksum_and_trailer_errors_are_distinct() {
        let mut raw = encode(SOD, 0x13, &[0x00]);
        let n = raw.len();
        raw[n - 2] ^= 0x40;
        assert!(matches!(Frame::decode(&raw), Err(Error::Checksum { .. })));

        let mut raw = encode(SOD, 0x13, &[0x00]);
        raw[n - 1] = 0x04;
        assert!(matches!(Frame::decode(&raw), Err(Error::Frame(_))));
    }

    #[test]
    fn recv_status_maps_error_status() {
        let mut link = FramedLink::new(MockTransport::with_rx(&encode(SOD, 0x93, &[0xe2])));
        match link.recv_status(0x13) {
            Err(Error::Device { command, code }) => {
                assert_eq!(command, 0x13);
                assert_eq!(code, 0xe2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn recv_frame_rejects_soh_from_device() {
        let mut link = FramedLink::new(MockTransport::with_rx(&encode(SOH, 0x00, &[0x00])));
        assert!(matches!(link.recv_frame(), Err(Error::Frame(_))));
    }

    #[test]
    fn recv_frame_short_body_is_frame_error() {
        let raw = encode(SOD, 0x15, &[0u8; 16]);
        let mut link = FramedLink::new(MockTransport::with_rx(&raw[..10]));
        match link.recv_frame() {
            Err(e @ Error::Frame(_)) => assert!(!e.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }

        let mut link = FramedLink::new(MockTransport::with_rx(&[]));
        assert!(matches!(link.recv_frame(), Err(Error::Timeout)));
    }

    #[test]
    fn echo_sends_received_bytes_verbatim() {
        let status = encode(SOD, 0x15, &[0x00]);
        let mut link = FramedLink::new(TricklingTransport {
            inner: MockTransport::with_rx(&status),
            slice: 2,
        });
        let frame = link.recv_status(0x15).unwrap();
        link.echo(&frame).unwrap();
        assert_eq!(link.transport_mut().inner.take_tx(), status);
    }
}
