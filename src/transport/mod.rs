//! Abstract byte-stream transport interface.
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub use self::serial::SerialTransport;

#[cfg(test)]
pub(crate) mod mock;
mod serial;

/// Abstraction of the transport layer.
///
/// A duplex byte stream with blocking-with-timeout receive, line-control
/// signals and a runtime-changeable baud rate.
pub trait Transport {
    /// Write `data`, returns the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes read, `0` when the window expired without
    /// data. Partial reads are valid.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn change_baud(&mut self, baud: u32) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let n = self.send(data)?;
        if n != data.len() {
            return Err(Error::Frame(format!(
                "short write: {} of {} bytes",
                n,
                data.len()
            )));
        }
        Ok(())
    }

    /// Fill `buf` completely within `timeout`, collecting partial reads.
    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = self.recv(&mut buf[filled..], remaining)?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            filled += n;
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).recv(buf, timeout)
    }

    fn change_baud(&mut self, baud: u32) -> Result<()> {
        (**self).change_baud(baud)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
