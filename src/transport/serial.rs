//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    thread::sleep,
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Transport;
use crate::error::Result;

const SERIAL_TIMEOUT_MS: u64 = 1000;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baud: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud);
        let serial_port = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port })
    }

    /// Pulse DTR/RTS so that boards wiring them to RES#/MD enter boot mode.
    pub fn enter_boot_mode(&mut self) -> Result<()> {
        self.set_dtr(true)?;
        self.set_rts(true)?;
        sleep(Duration::from_millis(50));
        self.set_rts(false)?;
        self.set_dtr(false)?;
        sleep(Duration::from_millis(100));
        self.serial_port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.serial_port.write_all(data)?;
        self.serial_port.flush()?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if timeout.is_zero() {
            return Ok(0);
        }
        self.serial_port.set_timeout(timeout)?;
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn change_baud(&mut self, baud: u32) -> Result<()> {
        log::debug!("Switching serial port to {} baud", baud);
        self.serial_port.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.serial_port.flush()?;
        self.serial_port.clear(ClearBuffer::All)?;
        Ok(())
    }
}
