//! Recovery and maintenance toolbox for the NX platform: AutoRCM marker
//! management, firmware package dumping, SD attribute repair, and USB
//! gadget sessions over the raw or emulated eMMC.

pub mod autorcm;
pub mod dump;
pub mod emmc;
pub mod emummc;
pub mod fsattr;
pub mod gpt;
pub mod hos;
pub mod output;
pub mod progress;
pub mod usb;
