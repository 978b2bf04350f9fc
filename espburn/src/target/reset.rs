//! Control-line sequences that reset the chip.
//!
//! On most boards DTR drives IO0 (boot mode select) and RTS drives EN
//! (chip enable) through an inverting transistor pair. Chips with the
//! integrated USB-Serial/JTAG bridge emulate the same lines in silicon but
//! need a different ordering.

use {
    crate::{error::Result, port::Port},
    log::{debug, trace},
    std::{thread, time::Duration},
};

/// USB product id of the integrated USB-Serial/JTAG bridge.
pub const USB_JTAG_SERIAL_PID: u16 = 0x1001;

/// Delay between control-line steps.
const STEP_DELAY: Duration = Duration::from_millis(100);

/// Delay after releasing EN before releasing IO0.
const RELEASE_DELAY: Duration = Duration::from_millis(50);

/// Extra EN-low hold for the ESP32 rev0 watchdog workaround.
const ESP32R0_HOLD_DELAY: Duration = Duration::from_millis(1200);

/// Extra wait after reset for the ESP32 rev0 watchdog to fire.
const ESP32R0_WATCHDOG_DELAY: Duration = Duration::from_millis(400);

/// A way of driving DTR/RTS to reset the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    /// Reset into the ROM loader through the usual auto-reset circuit.
    Classic {
        /// Hold EN low longer, for boards whose EN capacitor is too small
        /// (relies on a watchdog quirk of ESP32 revision 0).
        esp32r0_delay: bool,
    },
    /// Reset into the ROM loader through the USB-Serial/JTAG bridge.
    UsbJtagSerial,
    /// Pulse EN only, so the chip boots whatever is in flash.
    Hard,
}

impl ResetStrategy {
    /// Pick the download-mode reset for a port's USB product id.
    pub fn for_usb_pid(pid: Option<u16>, esp32r0_delay: bool) -> Self {
        if pid == Some(USB_JTAG_SERIAL_PID) {
            Self::UsbJtagSerial
        } else {
            Self::Classic { esp32r0_delay }
        }
    }

    /// Drive the control lines.
    pub fn apply<P: Port + ?Sized>(self, port: &mut P) -> Result<()> {
        debug!("Issuing {self:?} reset");
        match self {
            Self::Classic { esp32r0_delay } => {
                // IO0 high, EN low: chip held in reset
                signals(port, Some(false), Some(true))?;
                thread::sleep(STEP_DELAY);
                if esp32r0_delay {
                    thread::sleep(ESP32R0_HOLD_DELAY);
                }

                // IO0 low, EN high: chip boots into the loader
                signals(port, Some(true), Some(false))?;
                if esp32r0_delay {
                    thread::sleep(ESP32R0_WATCHDOG_DELAY);
                }
                thread::sleep(RELEASE_DELAY);

                signals(port, Some(false), Some(false))
            },
            Self::UsbJtagSerial => {
                signals(port, Some(false), Some(false))?;
                thread::sleep(STEP_DELAY);

                // IO0 low
                signals(port, Some(true), Some(false))?;
                thread::sleep(STEP_DELAY);

                // go through (1,1) rather than (0,0); Windows only
                // propagates DTR when RTS is written
                signals(port, None, Some(true))?;
                signals(port, Some(false), Some(true))?;
                thread::sleep(STEP_DELAY);

                signals(port, Some(false), Some(false))
            },
            Self::Hard => {
                signals(port, Some(false), Some(true))?;
                thread::sleep(STEP_DELAY);
                signals(port, Some(false), Some(false))
            },
        }
    }
}

fn signals<P: Port + ?Sized>(port: &mut P, dtr: Option<bool>, rts: Option<bool>) -> Result<()> {
    trace!("DTR={dtr:?} RTS={rts:?}");
    if let Some(level) = dtr {
        port.set_dtr(level)?;
    }
    if let Some(level) = rts {
        port.set_rts(level)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::port::mock::{MockDevice, Signal},
    };

    fn run(strategy: ResetStrategy) -> Vec<Signal> {
        let device = MockDevice::new(0x00F0_1D83);
        let mut port = device.port();
        strategy.apply(&mut port).unwrap();
        device.signals()
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            ResetStrategy::for_usb_pid(Some(USB_JTAG_SERIAL_PID), false),
            ResetStrategy::UsbJtagSerial
        );
        assert_eq!(
            ResetStrategy::for_usb_pid(Some(0xEA60), true),
            ResetStrategy::Classic { esp32r0_delay: true }
        );
        assert_eq!(
            ResetStrategy::for_usb_pid(None, false),
            ResetStrategy::Classic { esp32r0_delay: false }
        );
    }

    #[test]
    fn test_classic_sequence() {
        let signals = run(ResetStrategy::Classic { esp32r0_delay: false });
        assert_eq!(
            signals,
            vec![
                Signal::Dtr(false),
                Signal::Rts(true),
                Signal::Dtr(true),
                Signal::Rts(false),
                Signal::Dtr(false),
                Signal::Rts(false),
            ]
        );
    }

    #[test]
    fn test_usb_jtag_sequence_passes_through_both_high() {
        let signals = run(ResetStrategy::UsbJtagSerial);
        assert_eq!(
            signals,
            vec![
                Signal::Dtr(false),
                Signal::Rts(false),
                Signal::Dtr(true),
                Signal::Rts(false),
                Signal::Rts(true),
                Signal::Dtr(false),
                Signal::Rts(true),
                Signal::Dtr(false),
                Signal::Rts(false),
            ]
        );
    }

    #[test]
    fn test_hard_reset_leaves_io0_high() {
        let signals = run(ResetStrategy::Hard);
        assert!(!signals.contains(&Signal::Dtr(true)));
        assert_eq!(signals.last(), Some(&Signal::Rts(false)));
    }
}
