//! Scripted loader emulation for tests.
//!
//! [`MockDevice`] decodes every frame written through its [`MockPort`] and
//! answers the way a ROM loader (or, after a MEM_END with an entry point, a
//! stub) would. Tests can script dropped responses, failures and register
//! contents, and inspect the commands and control-line changes it saw.

#![allow(clippy::unwrap_used)]

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{
            command::Opcode,
            slip::{self, PacketQueue},
        },
        target::chip::CHIP_DETECT_MAGIC_REG_ADDR,
    },
    byteorder::{ByteOrder, LittleEndian},
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Condvar, Mutex},
        time::Duration,
    },
};

const ESP8266_MAGIC: u32 = 0xFFF0_C101;

/// A control-line change seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Dtr(bool),
    Rts(bool),
}

/// One decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentCommand {
    pub opcode: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl SentCommand {
    /// Payload as little-endian words (trailing partial word ignored).
    pub fn words(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect()
    }

    /// Data bytes of a block command (after the 16-byte block header).
    pub fn block_data(&self) -> &[u8] {
        &self.payload[16..]
    }
}

#[derive(Debug)]
struct DeviceState {
    magic: u32,
    registers: HashMap<u32, u32>,
    rom_status_len: usize,
    stub_running: bool,
    ignore_syncs: usize,
    drops: HashMap<u8, usize>,
    failures: HashMap<u8, u8>,
    security_info: Option<Vec<u8>>,
    commands: Vec<SentCommand>,
    signals: Vec<Signal>,
    bauds: Vec<u32>,
    rx: VecDeque<u8>,
    decoder: PacketQueue,
    unplugged: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

/// Emulated loader shared between a test and its [`MockPort`].
#[derive(Debug, Clone)]
pub(crate) struct MockDevice {
    shared: Arc<Shared>,
}

impl MockDevice {
    /// A device whose magic register reads `magic`.
    ///
    /// The ROM status length follows the family: two bytes for ESP8266,
    /// four for everything else.
    pub fn new(magic: u32) -> Self {
        let rom_status_len = if magic == ESP8266_MAGIC { 2 } else { 4 };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    magic,
                    registers: HashMap::new(),
                    rom_status_len,
                    stub_running: false,
                    ignore_syncs: 0,
                    drops: HashMap::new(),
                    failures: HashMap::new(),
                    security_info: None,
                    commands: Vec::new(),
                    signals: Vec::new(),
                    bauds: Vec::new(),
                    rx: VecDeque::new(),
                    decoder: PacketQueue::new(),
                    unplugged: false,
                }),
                readable: Condvar::new(),
            }),
        }
    }

    /// A port connected to this device.
    pub fn port(&self) -> MockPort {
        self.port_with_pid(None)
    }

    /// A port reporting the given USB product id.
    pub fn port_with_pid(&self, usb_pid: Option<u16>) -> MockPort {
        MockPort {
            shared: Arc::clone(&self.shared),
            baud: 115_200,
            usb_pid,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.shared
            .state
            .lock()
            .unwrap()
    }

    pub fn set_register(&self, addr: u32, value: u32) {
        self.state()
            .registers
            .insert(addr, value);
    }

    pub fn set_registers(&self, values: &[(u32, u32)]) {
        for &(addr, value) in values {
            self.set_register(addr, value);
        }
    }

    /// Leave the next `count` SYNC requests unanswered.
    pub fn ignore_syncs(&self, count: usize) {
        self.state()
            .ignore_syncs = count;
    }

    /// Leave the next `count` requests of `opcode` unanswered.
    pub fn drop_next(&self, opcode: Opcode, count: usize) {
        self.state()
            .drops
            .insert(opcode as u8, count);
    }

    /// Answer every `opcode` request with a failure status.
    pub fn fail(&self, opcode: Opcode, code: u8) {
        self.state()
            .failures
            .insert(opcode as u8, code);
    }

    pub fn set_security_info(&self, data: Vec<u8>) {
        self.state()
            .security_info = Some(data);
    }

    /// Make every further read and write fail.
    pub fn unplug(&self) {
        self.state()
            .unplugged = true;
        self.shared
            .readable
            .notify_all();
    }

    pub fn stub_running(&self) -> bool {
        self.state()
            .stub_running
    }

    pub fn commands(&self) -> Vec<SentCommand> {
        self.state()
            .commands
            .clone()
    }

    pub fn commands_of(&self, opcode: Opcode) -> Vec<SentCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.opcode == opcode as u8)
            .collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.commands_of(opcode)
            .len()
    }

    /// Opcodes in the order they were received.
    pub fn opcodes(&self) -> Vec<u8> {
        self.commands()
            .iter()
            .map(|c| c.opcode)
            .collect()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.state()
            .signals
            .clone()
    }

    pub fn baud_history(&self) -> Vec<u32> {
        self.state()
            .bauds
            .clone()
    }
}

impl DeviceState {
    fn status_len(&self) -> usize {
        if self.stub_running { 2 } else { self.rom_status_len }
    }

    fn push_frame(&mut self, payload: &[u8]) {
        self.rx
            .extend(slip::encode(payload));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn respond(&mut self, opcode: u8, value: u32, data: &[u8]) {
        let mut payload = vec![0x01, opcode];
        payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(data);
        self.push_frame(&payload);
    }

    fn handle(&mut self, frame: &[u8]) {
        if frame.len() < 8 || frame[0] != 0x00 {
            return;
        }
        let command = SentCommand {
            opcode: frame[1],
            checksum: LittleEndian::read_u32(&frame[4..8]),
            payload: frame[8..].to_vec(),
        };
        let opcode = command.opcode;
        self.commands
            .push(command.clone());

        if opcode == Opcode::Sync as u8 && self.ignore_syncs > 0 {
            self.ignore_syncs -= 1;
            return;
        }
        if let Some(remaining) = self
            .drops
            .get_mut(&opcode)
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            return;
        }

        let status_len = self.status_len();
        let mut status = vec![0u8; status_len];
        if let Some(&code) = self
            .failures
            .get(&opcode)
        {
            status[0] = 1;
            status[1] = code;
            self.respond(opcode, 0, &status);
            return;
        }

        match Opcode::from_u8(opcode) {
            Some(Opcode::Sync) => {
                // ROM loaders answer a single SYNC several times
                self.respond(opcode, 0, &status);
                self.respond(opcode, 0, &status);
            },
            Some(Opcode::ReadReg) => {
                let addr = command.words()[0];
                let value = if addr == CHIP_DETECT_MAGIC_REG_ADDR {
                    self.magic
                } else {
                    self.registers
                        .get(&addr)
                        .copied()
                        .unwrap_or(0)
                };
                self.respond(opcode, value, &status);
            },
            Some(Opcode::GetSecurityInfo) => {
                let mut data = self
                    .security_info
                    .clone()
                    .unwrap_or_default();
                data.extend_from_slice(&status);
                self.respond(opcode, 0, &data);
            },
            Some(Opcode::MemEnd) => {
                self.respond(opcode, 0, &status);
                let words = command.words();
                if words[0] == 0 && words[1] != 0 {
                    self.stub_running = true;
                    self.push_frame(b"OHAI");
                }
            },
            _ => self.respond(opcode, 0, &status),
        }
    }
}

/// Host side of a [`MockDevice`].
pub(crate) struct MockPort {
    shared: Arc<Shared>,
    baud: u32,
    usb_pid: Option<u16>,
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        MockReader {
            shared: Arc::clone(&self.shared),
        }
        .read(buf)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap();
        if state.unplugged {
            return Err(unplugged());
        }
        let frames = state
            .decoder
            .push(buf);
        for frame in frames {
            state.handle(&frame);
        }
        self.shared
            .readable
            .notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        "mock"
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        self.shared
            .state
            .lock()
            .unwrap()
            .bauds
            .push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.shared
            .state
            .lock()
            .unwrap()
            .rx
            .clear();
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.shared
            .state
            .lock()
            .unwrap()
            .signals
            .push(Signal::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.shared
            .state
            .lock()
            .unwrap()
            .signals
            .push(Signal::Rts(level));
        Ok(())
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        if self
            .shared
            .state
            .lock()
            .unwrap()
            .unplugged
        {
            return Err(Error::Io(unplugged()));
        }
        Ok(Box::new(MockReader {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn usb_pid(&self) -> Option<u16> {
        self.usb_pid
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockReader {
    shared: Arc<Shared>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap();
        if state.rx.is_empty() && !state.unplugged {
            state = self
                .shared
                .readable
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap()
                .0;
        }
        if state.unplugged {
            return Err(unplugged());
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf
            .len()
            .min(state.rx.len());
        for (slot, byte) in buf
            .iter_mut()
            .zip(state.rx.drain(..n))
        {
            *slot = byte;
        }
        Ok(n)
    }
}
