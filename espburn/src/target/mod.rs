//! Chip families, identity decoding and reset strategies.

pub mod chip;
pub mod efuse;
pub mod reset;

pub use chip::{ChipFamily, ChipProfile};
pub use efuse::{ChipInfo, ChipRevision, RegisterRead};
pub use reset::ResetStrategy;
