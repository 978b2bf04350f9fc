//! Command channel: one framed write per request, responses correlated by
//! opcode.
//!
//! A background reader thread owns a cloned read handle of the port and the
//! [`PacketQueue`]. Every decoded response is offered to the per-opcode
//! slot table; a caller waiting in [`CommandChannel::command`] wakes up when
//! its slot is filled. At most one command per opcode can be pending: a
//! second claim on the same opcode is rejected instead of racing.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{
            command::{Opcode, Request, Response, RetryPolicy, SYNC_PAYLOAD},
            security::SecurityInfo,
            slip::{self, PacketQueue},
            trace::{FrameTracer, TraceDirection},
        },
    },
    log::{debug, trace, warn},
    std::{
        collections::HashMap,
        io::{ErrorKind, Read},
        sync::{
            Arc, Condvar, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Status length of a loader whose family is not known yet.
pub const DEFAULT_STATUS_LEN: usize = 2;

/// Delay between switching the host baud rate and resuming reads.
const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Which loader is answering on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    /// Mask ROM bootloader.
    Rom {
        /// Number of trailing status bytes in every response.
        status_len: usize,
    },
    /// Flasher stub uploaded into RAM.
    Stub {
        /// Number of trailing status bytes in every response.
        status_len: usize,
    },
}

impl Loader {
    /// Number of trailing status bytes in every response.
    pub fn status_len(self) -> usize {
        match self {
            Self::Rom { status_len } | Self::Stub { status_len } => status_len,
        }
    }

    /// Whether the stub is running.
    pub fn is_stub(self) -> bool {
        matches!(self, Self::Stub { .. })
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::Rom {
            status_len: DEFAULT_STATUS_LEN,
        }
    }
}

/// Result of a successful status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The response carried only status bytes; this is its value field.
    Value(u32),
    /// Data preceding the status bytes.
    Data(Vec<u8>),
}

#[derive(Debug, Default)]
struct SlotState {
    pending: HashMap<u8, Option<Response>>,
    closed: bool,
}

/// One pending-response slot per opcode.
#[derive(Debug, Default)]
struct ResponseSlots {
    state: Mutex<SlotState>,
    filled: Condvar,
}

impl ResponseSlots {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // One slot per opcode: a late reply landing after `release` fills the
    // next claim for the same opcode.
    fn claim(&self, opcode: u8) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Disconnected);
        }
        if state
            .pending
            .contains_key(&opcode)
        {
            return Err(Error::Protocol(format!(
                "command 0x{opcode:02X} is already in flight"
            )));
        }
        state
            .pending
            .insert(opcode, None);
        Ok(())
    }

    fn wait(&self, opcode: u8, timeout: Duration) -> Result<Option<Response>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Error::Disconnected);
            }
            if let Some(response) = state
                .pending
                .get_mut(&opcode)
                .and_then(Option::take)
            {
                return Ok(Some(response));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .filled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, opcode: u8) {
        self.lock()
            .pending
            .remove(&opcode);
    }

    fn deliver(&self, response: Response) -> bool {
        let mut state = self.lock();
        match state
            .pending
            .get_mut(&response.opcode)
        {
            Some(slot) if slot.is_none() => {
                *slot = Some(response);
                self.filled
                    .notify_all();
                true
            },
            _ => false,
        }
    }

    fn close(&self) {
        self.lock()
            .closed = true;
        self.filled
            .notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock()
            .closed
    }
}

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Cancels a channel from another thread.
///
/// Pending and future commands fail with [`Error::Disconnected`].
#[derive(Clone)]
pub struct CloseHandle {
    slots: Arc<ResponseSlots>,
}

impl CloseHandle {
    /// Mark the channel closed and wake any waiting command.
    pub fn close(&self) {
        self.slots
            .close();
    }
}

/// Request/response channel to a ROM or stub loader.
pub struct CommandChannel<P: Port> {
    port: P,
    loader: Loader,
    slots: Arc<ResponseSlots>,
    reader: Option<ReaderHandle>,
    tracer: FrameTracer,
}

impl<P: Port> CommandChannel<P> {
    /// Start a channel on an open port, talking to the ROM loader.
    pub fn open(port: P, tracer: FrameTracer) -> Result<Self> {
        let mut channel = Self {
            port,
            loader: Loader::default(),
            slots: Arc::new(ResponseSlots::default()),
            reader: None,
            tracer,
        };
        channel
            .port
            .clear_buffers()?;
        channel.start_reader()?;
        Ok(channel)
    }

    /// Rebind the channel to a different loader.
    ///
    /// Used once the chip family is known (ROM status length) and again at
    /// stub handoff.
    #[must_use]
    pub fn with_loader(mut self, loader: Loader) -> Self {
        debug!("Command channel bound to {loader:?}");
        self.loader = loader;
        self
    }

    /// The loader this channel talks to.
    pub fn loader(&self) -> Loader {
        self.loader
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    ///
    /// Only for control-line and baud changes while no command is pending.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// A handle that can cancel this channel from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            slots: Arc::clone(&self.slots),
        }
    }

    /// Whether the channel has been closed or its reader died.
    pub fn is_closed(&self) -> bool {
        self.slots
            .is_closed()
    }

    fn start_reader(&mut self) -> Result<()> {
        let mut source = self
            .port
            .try_clone_reader()?;
        let stop = Arc::new(AtomicBool::new(false));
        let slots = Arc::clone(&self.slots);
        let tracer = self
            .tracer
            .clone();
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("espburn-reader".into())
            .spawn(move || {
                let mut queue = PacketQueue::new();
                let mut buf = [0u8; 1024];
                while !stop_flag.load(Ordering::Acquire) {
                    match source.read(&mut buf) {
                        Ok(0) => thread::sleep(Duration::from_millis(1)),
                        Ok(n) => {
                            for frame in queue.push(&buf[..n]) {
                                tracer.record(TraceDirection::Read, &frame);
                                dispatch(&slots, &frame);
                            }
                        },
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                            ) => {},
                        Err(e) => {
                            if !stop_flag.load(Ordering::Acquire) {
                                warn!("Serial reader stopped: {e}");
                            }
                            slots.close();
                            break;
                        },
                    }
                }
                trace!("Serial reader exiting");
            })?;

        self.reader = Some(ReaderHandle { stop, thread });
        Ok(())
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self
            .reader
            .take()
        {
            reader
                .stop
                .store(true, Ordering::Release);
            if reader
                .thread
                .join()
                .is_err()
            {
                warn!("Serial reader thread panicked");
            }
        }
    }

    /// Send a request and wait for the response with the same opcode.
    ///
    /// Each attempt rewrites the same frame and waits `policy.timeout`.
    pub fn command(&mut self, request: &Request, policy: RetryPolicy) -> Result<Response> {
        let opcode = request.opcode();
        let raw = request.to_bytes();
        let frame = slip::encode(&raw);

        self.slots
            .claim(opcode as u8)?;
        let result = self.exchange(opcode, &raw, &frame, policy);
        self.slots
            .release(opcode as u8);
        result
    }

    fn exchange(
        &mut self,
        opcode: Opcode,
        raw: &[u8],
        frame: &[u8],
        policy: RetryPolicy,
    ) -> Result<Response> {
        let tries = policy
            .tries
            .max(1);
        for attempt in 1..=tries {
            self.tracer
                .record(TraceDirection::Write, raw);
            self.port
                .write_frame(frame)?;

            if let Some(response) = self
                .slots
                .wait(opcode as u8, policy.timeout)?
            {
                return Ok(response);
            }
            if attempt < tries {
                trace!("No response to {opcode} (attempt {attempt}/{tries}), retrying");
            }
        }

        Err(Error::Timeout(format!(
            "{opcode} got no response after {tries} attempt(s) of {} ms",
            policy
                .timeout
                .as_millis()
        )))
    }

    /// Validate the trailing status bytes of a response.
    pub fn check(&self, response: Response) -> Result<Reply> {
        let status_len = self
            .loader
            .status_len();
        let Response {
            opcode,
            value,
            mut data,
        } = response;

        if data.len() < status_len {
            return Err(Error::Protocol(format!(
                "response to 0x{opcode:02X} has {} data bytes, expected at least {status_len}",
                data.len()
            )));
        }

        let status = data.split_off(data.len() - status_len);
        if status[0] != 0 {
            return Err(Error::CommandFailed { opcode, status });
        }

        if data.is_empty() {
            Ok(Reply::Value(value))
        } else {
            Ok(Reply::Data(data))
        }
    }

    /// Send a request and check its status.
    pub fn execute(&mut self, request: &Request, policy: RetryPolicy) -> Result<Reply> {
        let response = self.command(request, policy)?;
        self.check(response)
    }

    /// Probe the loader with a single SYNC request.
    pub fn sync(&mut self) -> Result<()> {
        let request = Request::new(Opcode::Sync, SYNC_PAYLOAD.to_vec());
        self.command(&request, RetryPolicy::SYNC)?;
        Ok(())
    }

    /// Read a 32-bit register.
    pub fn read_reg(&mut self, addr: u32) -> Result<u32> {
        let request = Request::from_words(Opcode::ReadReg, &[addr]);
        let response = self.command(&request, RetryPolicy::CONTROL)?;
        Ok(response.value)
    }

    /// Announce a RAM download.
    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, offset: u32) -> Result<()> {
        let request = Request::from_words(Opcode::MemBegin, &[size, blocks, block_size, offset]);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Send one RAM block.
    pub fn mem_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        let request = Request::data_block(Opcode::MemData, data, seq);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Finish a RAM download. A non-zero `entry` makes the loader jump there
    /// and stay resident; zero returns to the loader.
    pub fn mem_finish(&mut self, entry: u32) -> Result<()> {
        let request = Request::from_words(Opcode::MemEnd, &[u32::from(entry == 0), entry]);
        self.execute(&request, RetryPolicy::MEM_END)?;
        Ok(())
    }

    /// Begin a raw flash write; the loader erases `erase_size` bytes.
    pub fn flash_begin(
        &mut self,
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<()> {
        let request =
            Request::from_words(Opcode::FlashBegin, &[erase_size, blocks, block_size, offset]);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Send one raw flash block.
    pub fn flash_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        let request = Request::data_block(Opcode::FlashData, data, seq);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Leave raw flash mode.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        let request = Request::from_words(Opcode::FlashEnd, &[u32::from(!reboot)]);
        self.execute(&request, RetryPolicy::CONTROL)?;
        Ok(())
    }

    /// Begin a compressed flash write.
    pub fn flash_defl_begin(
        &mut self,
        write_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<()> {
        let request =
            Request::from_words(Opcode::FlashDeflBegin, &[write_size, blocks, block_size, offset]);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Send one compressed flash block.
    pub fn flash_defl_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        let request = Request::data_block(Opcode::FlashDeflData, data, seq);
        self.execute(&request, RetryPolicy::DATA)?;
        Ok(())
    }

    /// Leave compressed flash mode.
    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<()> {
        let request = Request::from_words(Opcode::FlashDeflEnd, &[u32::from(!reboot)]);
        self.execute(&request, RetryPolicy::CONTROL)?;
        Ok(())
    }

    /// Ask the loader to switch baud rate, then follow on the host side.
    ///
    /// The reader is stopped across the switch and restarted on a fresh
    /// handle at the new rate.
    pub fn change_baud(&mut self, new_baud: u32) -> Result<()> {
        let old_baud = self
            .port
            .baud_rate();
        let previous = if self
            .loader
            .is_stub()
        {
            old_baud
        } else {
            0
        };
        debug!("Changing baud rate from {old_baud} to {new_baud}");

        let request = Request::from_words(Opcode::ChangeBaudrate, &[new_baud, previous]);
        self.execute(&request, RetryPolicy::CONTROL)?;

        self.stop_reader();
        self.port
            .set_baud_rate(new_baud)?;
        thread::sleep(BAUD_SETTLE_DELAY);
        self.port
            .clear_buffers()?;
        self.start_reader()
    }

    /// Query secure boot and flash encryption state.
    pub fn security_info(&mut self) -> Result<SecurityInfo> {
        let request = Request::new(Opcode::GetSecurityInfo, Vec::new());
        match self.execute(&request, RetryPolicy::CONTROL)? {
            Reply::Data(data) => SecurityInfo::parse(&data),
            Reply::Value(_) => Err(Error::Protocol(
                "security info reply carried no data".into(),
            )),
        }
    }

    /// Stop the reader and close the port. Safe to call more than once.
    pub fn close(&mut self) {
        self.slots
            .close();
        self.stop_reader();
        if let Err(e) = self
            .port
            .close()
        {
            debug!("Error while closing port: {e}");
        }
    }
}

impl<P: Port> Drop for CommandChannel<P> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

fn dispatch(slots: &ResponseSlots, frame: &[u8]) {
    match Response::parse(frame) {
        Some(response) => {
            let opcode = response.opcode;
            if !slots.deliver(response) {
                trace!("Dropping unsolicited response to 0x{opcode:02X}");
            }
        },
        None => trace!("Ignoring non-response frame ({} bytes)", frame.len()),
    }
}
