//! Reset into download mode, sync, and identify the chip family.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::channel::CommandChannel,
        target::{
            chip::{CHIP_DETECT_MAGIC_REG_ADDR, ChipFamily, ChipProfile},
            reset::{ResetStrategy, USB_JTAG_SERIAL_PID},
        },
    },
    log::{debug, info},
    std::{thread, time::Duration},
};

/// Default number of reset+sync cycles (each tries both reset timings).
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 7;

/// SYNC requests sent after each reset.
pub const SYNC_ATTEMPTS: usize = 5;

/// Pause between failed SYNC requests.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bootstrap progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing attempted yet.
    Idle,
    /// Driving the control lines.
    Resetting,
    /// Waiting for a SYNC reply.
    Syncing,
    /// The loader answered and its family is known.
    Detected(ChipFamily),
    /// Every attempt failed or the family is unknown.
    Failed,
}

/// Drives reset strategies and SYNC until the ROM loader answers, then
/// reads the magic register to pick a [`ChipProfile`].
#[derive(Debug)]
pub struct Bootstrap {
    attempts: usize,
    state: BootstrapState,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_ATTEMPTS)
    }
}

impl Bootstrap {
    /// A sequencer making at most `attempts` outer reset cycles.
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            state: BootstrapState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Connect and detect.
    pub fn run<P: Port>(&mut self, channel: &mut CommandChannel<P>) -> Result<&'static ChipProfile> {
        let result = self
            .connect(channel)
            .and_then(|()| self.detect(channel));
        if result.is_err() {
            self.state = BootstrapState::Failed;
        }
        result
    }

    /// Reset and sync until the loader answers.
    ///
    /// Each outer attempt tries the normal reset timing first and then the
    /// long-hold variant.
    pub fn connect<P: Port>(&mut self, channel: &mut CommandChannel<P>) -> Result<()> {
        let usb_pid = channel
            .port()
            .usb_pid();
        if usb_pid == Some(USB_JTAG_SERIAL_PID) {
            info!("Detected integrated USB Serial/JTAG");
        }

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                debug!("Connection attempt {attempt}/{}", self.attempts);
            }
            for esp32r0_delay in [false, true] {
                if crate::is_interrupted_requested() {
                    return Err(Error::Interrupted);
                }
                let strategy = ResetStrategy::for_usb_pid(usb_pid, esp32r0_delay);
                if self.attempt(channel, strategy)? {
                    return Ok(());
                }
            }
        }

        self.state = BootstrapState::Failed;
        Err(Error::ConnectFailed(format!(
            "no SYNC response from {} after {} attempts",
            channel
                .port()
                .name(),
            self.attempts
        )))
    }

    fn attempt<P: Port>(
        &mut self,
        channel: &mut CommandChannel<P>,
        strategy: ResetStrategy,
    ) -> Result<bool> {
        self.state = BootstrapState::Resetting;
        strategy.apply(channel.port_mut())?;

        self.state = BootstrapState::Syncing;
        for _ in 0..SYNC_ATTEMPTS {
            match channel.sync() {
                Ok(()) => return Ok(true),
                Err(e @ (Error::Disconnected | Error::Io(_))) => return Err(e),
                Err(e) => {
                    debug!("Sync failed: {e}");
                    thread::sleep(SYNC_RETRY_DELAY);
                },
            }
        }
        Ok(false)
    }

    /// Read the magic register and match it against the known families.
    pub fn detect<P: Port>(&mut self, channel: &mut CommandChannel<P>) -> Result<&'static ChipProfile> {
        let magic = channel.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        debug!("Chip magic value: 0x{magic:08X}");

        let family = ChipFamily::from_magic(magic).ok_or(Error::UnsupportedChip(magic))?;
        info!("Detected {family}");
        self.state = BootstrapState::Detected(family);
        Ok(family.profile())
    }
}
