//! Scripted in-memory transport for protocol tests.
use std::{collections::VecDeque, time::Duration};

use super::Transport;
use crate::error::Result;

/// Delivers a pre-loaded byte queue and records everything sent.
///
/// An empty queue behaves like an expired read window.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub bauds: Vec<u32>,
    pub rts: Vec<bool>,
    pub dtr: Vec<bool>,
    pub closed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rx(bytes: &[u8]) -> Self {
        let mut mock = Self::new();
        mock.push_rx(bytes);
        mock
    }

    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Drain the sent log.
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.tx.extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn change_baud(&mut self, baud: u32) -> Result<()> {
        self.bauds.push(baud);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts.push(level);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr.push(level);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Serves reads in fixed-size slices to exercise partial-read handling.
#[derive(Debug)]
pub(crate) struct TricklingTransport {
    pub inner: MockTransport,
    pub slice: usize,
}

impl Transport for TricklingTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.send(data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = buf.len().min(self.slice);
        self.inner.recv(&mut buf[..n], timeout)
    }

    fn change_baud(&mut self, baud: u32) -> Result<()> {
        self.inner.change_baud(baud)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.inner.set_rts(level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.inner.set_dtr(level)
    }
}
