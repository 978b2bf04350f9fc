//! Talking to the chip's loaders: bring-up, stub upload and flashing.
//!
//! ```text
//! Bootstrap ──> run_stub (optional) ──> FlashProgrammer
//!   reset          MEM_BEGIN/DATA/END     FLASH_(DEFL_)BEGIN/DATA/END
//!   SYNC           rebind to stub
//!   READ_REG magic
//! ```

pub mod bootstrap;
pub mod flasher;
pub mod stub;

pub use bootstrap::{Bootstrap, BootstrapState};
pub use flasher::{FlashProgrammer, FlashProgress};
pub use stub::{StubImage, StubStore, run_stub};
