//! Connect, flash and disconnect as one session over a port.
//!
//! ```text
//! Closed -> Opening -> Detecting -> [StubUpload] -> [BaudBoost] -> Ready
//!                                                                  |
//!                              Closed <------- Flashing <----------+
//! ```
//!
//! Any failure after the port is opened closes the session, so the
//! transport is never left half-configured.

use {
    crate::{
        error::{Error, Result},
        image::FlashArgs,
        loader::{
            bootstrap::{Bootstrap, DEFAULT_CONNECT_ATTEMPTS},
            flasher::{FlashProgrammer, FlashProgress},
            stub::{StubStore, run_stub},
        },
        port::Port,
        protocol::{channel::CommandChannel, security::SecurityInfo, trace::FrameTracer},
        target::{
            chip::{ChipFamily, ChipProfile},
            efuse::{ChipInfo, ChipRevision},
            reset::ResetStrategy,
        },
    },
    log::{debug, info, warn},
    std::fmt,
};

/// Baud rate used to talk to the ROM loader.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rate requested once the stub is running.
pub const DEFAULT_FLASH_BAUD: u32 = 960_000;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port attached.
    Closed,
    /// Port being configured.
    Opening,
    /// Resetting, syncing and reading chip identity.
    Detecting,
    /// Uploading the flasher stub.
    StubUpload,
    /// Switching to the flash baud rate.
    BaudBoost,
    /// Connected and idle.
    Ready,
    /// Writing partitions.
    Flashing,
}

/// Chip identity announced when a session connects.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConnectEvent {
    /// Detected family.
    pub chip: ChipFamily,
    /// One-line description including the revision.
    pub description: String,
    /// Package model.
    pub model: String,
    /// Silicon revision.
    pub revision: ChipRevision,
    /// Factory MAC address.
    pub mac: Option<String>,
    /// In-package flash size in MB.
    pub flash_size: Option<u32>,
    /// In-package PSRAM size in MB.
    pub psram_size: Option<u32>,
}

impl ConnectEvent {
    fn new(chip: ChipFamily, info: &ChipInfo) -> Self {
        Self {
            chip,
            description: info
                .description
                .clone(),
            model: info
                .model
                .clone(),
            revision: info.revision,
            mac: info
                .mac
                .clone(),
            flash_size: info.flash_size_mb,
            psram_size: info.psram_size_mb,
        }
    }
}

/// Events reported to the session's listener.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The chip was identified.
    Connect(ConnectEvent),
    /// A flash block was acknowledged.
    Progress(FlashProgress),
    /// The session released its port.
    Disconnect,
}

type Listener = Box<dyn FnMut(&Event) + Send>;

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Baud rate for the ROM loader.
    pub baud: u32,
    /// Baud rate once the stub is running.
    pub flash_baud: u32,
    /// Compress flash data on the wire.
    pub compress: bool,
    /// Outer reset+sync cycles.
    pub connect_attempts: usize,
    /// Upload the flasher stub when one is available.
    pub use_stub: bool,
    /// Stub images by family.
    pub stubs: StubStore,
    /// Frame tracer for the command channel.
    pub tracer: FrameTracer,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            flash_baud: DEFAULT_FLASH_BAUD,
            compress: true,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            use_stub: true,
            stubs: StubStore::new(),
            tracer: FrameTracer::disabled(),
        }
    }
}

impl SessionConfig {
    /// Set the ROM baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Set the post-stub baud rate.
    #[must_use]
    pub fn with_flash_baud(mut self, baud: u32) -> Self {
        self.flash_baud = baud;
        self
    }

    /// Enable or disable compression.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the number of outer connect attempts.
    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Enable or disable stub upload.
    #[must_use]
    pub fn with_stub(mut self, use_stub: bool) -> Self {
        self.use_stub = use_stub;
        self
    }

    /// Set the stub images.
    #[must_use]
    pub fn with_stubs(mut self, stubs: StubStore) -> Self {
        self.stubs = stubs;
        self
    }

    /// Set the frame tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: FrameTracer) -> Self {
        self.tracer = tracer;
        self
    }
}

/// One connection to one chip.
///
/// ## Example
///
/// ```rust,no_run
/// use espburn::{
///     image::{FlashArgs, Partition},
///     port::{NativePort, SerialConfig},
///     session::{Event, Session, SessionConfig},
/// };
///
/// fn main() -> espburn::Result<()> {
///     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
///     let mut session = Session::new(SessionConfig::default()).on_event(|event| {
///         if let Event::Connect(chip) = event {
///             println!("Connected to {}", chip.description);
///         }
///     });
///     session.open(port)?;
///     session.flash(&FlashArgs::new(vec![Partition::new(0x10000, std::fs::read("app.bin")?)]))?;
///     Ok(())
/// }
/// ```
pub struct Session<P: Port> {
    config: SessionConfig,
    channel: Option<CommandChannel<P>>,
    profile: Option<ChipProfile>,
    info: Option<ChipInfo>,
    state: SessionState,
    listener: Option<Listener>,
}

impl<P: Port> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("profile", &self.profile.map(|p| p.name))
            .field("stub", &self.profile.is_some_and(|p| p.is_stub))
            .finish_non_exhaustive()
    }
}

impl<P: Port> Session<P> {
    /// A closed session.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            channel: None,
            profile: None,
            info: None,
            state: SessionState::Closed,
            listener: None,
        }
    }

    /// Register the event listener.
    #[must_use]
    pub fn on_event<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Active loader profile (stub variant once the stub runs).
    pub fn profile(&self) -> Option<&ChipProfile> {
        self.profile
            .as_ref()
    }

    /// Identity decoded at connect time.
    pub fn chip_info(&self) -> Option<&ChipInfo> {
        self.info
            .as_ref()
    }

    fn emit(&mut self, event: &Event) {
        if let Some(listener) = self
            .listener
            .as_mut()
        {
            listener(event);
        }
    }

    /// Connect to the chip behind `port` and bring it to [`SessionState::Ready`].
    pub fn open(&mut self, port: P) -> Result<&ChipInfo> {
        if self.state != SessionState::Closed {
            return Err(Error::Protocol("session is already open".into()));
        }
        match self.bring_up(port) {
            Ok(()) => self
                .info
                .as_ref()
                .ok_or(Error::Disconnected),
            Err(e) => {
                warn!("Connect failed: {e}");
                self.close();
                Err(e)
            },
        }
    }

    fn bring_up(&mut self, mut port: P) -> Result<()> {
        self.state = SessionState::Opening;
        port.set_baud_rate(self.config.baud)?;
        let channel = CommandChannel::open(
            port,
            self.config
                .tracer
                .clone(),
        )?;
        let channel = self
            .channel
            .insert(channel);

        self.state = SessionState::Detecting;
        let rom = *Bootstrap::new(self.config.connect_attempts).run(channel)?;
        let channel = self
            .channel
            .take()
            .ok_or(Error::Disconnected)?
            .with_loader(rom.loader());
        let channel = self
            .channel
            .insert(channel);

        let info = rom.chip_info(channel)?;
        info!("Chip is {info}");
        if let Some(mac) = &info.mac {
            info!("MAC: {mac}");
        }
        self.emit(&Event::Connect(ConnectEvent::new(rom.family, &info)));
        self.info = Some(info);

        let mut profile = rom;
        let stub = self
            .config
            .use_stub
            .then(|| {
                self.config
                    .stubs
                    .get(rom.family)
            })
            .flatten()
            .cloned();
        if let Some(stub) = stub {
            self.state = SessionState::StubUpload;
            let channel = self
                .channel
                .take()
                .ok_or(Error::Disconnected)?;
            let (channel, stub_profile) = run_stub(channel, &rom, &stub)?;
            self.channel = Some(channel);
            profile = stub_profile;
        } else {
            debug!("No stub for {}, staying on the ROM loader", rom.family);
        }

        let channel = self
            .channel
            .as_mut()
            .ok_or(Error::Disconnected)?;
        if profile.needs_spi_attach {
            FlashProgrammer::new(channel, &profile).attach_flash()?;
        }

        if profile.is_stub && self.config.flash_baud != self.config.baud {
            self.state = SessionState::BaudBoost;
            channel.change_baud(self.config.flash_baud)?;
            info!("Changed baud rate to {}", self.config.flash_baud);
        }

        self.profile = Some(profile);
        self.state = SessionState::Ready;
        Ok(())
    }

    fn ready(&self) -> Result<ChipProfile> {
        if self.state != SessionState::Ready {
            return Err(Error::Protocol(format!(
                "session is {:?}, not ready",
                self.state
            )));
        }
        self.profile
            .ok_or(Error::Disconnected)
    }

    /// Query secure boot and flash encryption state.
    pub fn security_info(&mut self) -> Result<SecurityInfo> {
        self.ready()?;
        self.channel
            .as_mut()
            .ok_or(Error::Disconnected)?
            .security_info()
    }

    /// Write `args`, reset the chip into the new firmware, and close.
    pub fn flash(&mut self, args: &FlashArgs) -> Result<()> {
        let profile = self.ready()?;
        let compress = self.config.compress;
        self.state = SessionState::Flashing;

        let mut listener = self
            .listener
            .take();
        let result = match self
            .channel
            .as_mut()
        {
            Some(channel) => write_and_reset(channel, &profile, compress, args, &mut |progress| {
                if let Some(listener) = listener.as_mut() {
                    listener(&Event::Progress(progress));
                }
            }),
            None => Err(Error::Disconnected),
        };
        self.listener = listener;

        self.close();
        result
    }

    /// Stop the reader and release the port. Safe to call more than once.
    ///
    /// Every session that left [`SessionState::Closed`] reports exactly one
    /// [`Event::Disconnect`], however far bring-up got.
    pub fn close(&mut self) {
        if let Some(mut channel) = self
            .channel
            .take()
        {
            channel.close();
        }
        if self.state != SessionState::Closed {
            self.emit(&Event::Disconnect);
        }
        self.profile = None;
        self.info = None;
        self.state = SessionState::Closed;
    }
}

fn write_and_reset<P: Port>(
    channel: &mut CommandChannel<P>,
    profile: &ChipProfile,
    compress: bool,
    args: &FlashArgs,
    progress: &mut dyn FnMut(FlashProgress),
) -> Result<()> {
    FlashProgrammer::new(channel, profile)
        .with_compression(compress)
        .flash(args, progress)?;
    // stub targets were reset by the programmer
    if !profile.is_stub {
        info!("Hard resetting");
        ResetStrategy::Hard.apply(channel.port_mut())?;
    }
    Ok(())
}

impl<P: Port> Drop for Session<P> {
    fn drop(&mut self) {
        self.close();
    }
}
