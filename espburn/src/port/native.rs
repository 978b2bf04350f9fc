//! [`Port`] over a host serial device, using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// A serial device opened 8N1 for a loader session.
pub struct NativePort {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    baud_rate: u32,
    reader_poll: Duration,
    usb_pid: Option<u16>,
}

impl NativePort {
    /// Open the device named in `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        let usb_pid = lookup_usb_pid(&config.port_name);
        debug!(
            "Opened {} at {} baud (USB PID: {:?})",
            config.port_name, config.baud_rate, usb_pid
        );

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            baud_rate: config.baud_rate,
            reader_poll: config.reader_poll,
            usb_pid,
        })
    }

    fn device(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

/// The enumerator knows the USB identity, the opened handle does not.
fn lookup_usb_pid(port_name: &str) -> Option<u16> {
    crate::device::detect_ports()
        .into_iter()
        .find(|p| p.name == port_name)
        .and_then(|p| p.pid)
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(p) = self.port.as_mut() {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(p) = self.port.as_mut() {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR={level}", self.name);
        self.device()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS={level}", self.name);
        self.device()?.write_request_to_send(level)?;
        Ok(())
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        let port = self
            .port
            .as_ref()
            .ok_or(Error::Disconnected)?;
        let mut reader = port.try_clone()?;
        reader.set_timeout(self.reader_poll)?;
        Ok(Box::new(reader))
    }

    fn usb_pid(&self) -> Option<u16> {
        self.usb_pid
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.device()?.flush()
    }
}
