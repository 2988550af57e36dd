//! On-disk formats of the HOS boot chain.
//!
//! `pkg1` is the first-stage package stored in the eMMC BOOT0 partition
//! (bootloader, secure monitor, warmboot blob); `pkg2` is the second-stage
//! package stored in its own GPP partition (kernel plus the INI1 pack of
//! initial processes). The cryptography that guards both is an external
//! engine reached through the traits in [`keys`]; this module only knows the
//! plaintext layouts and the identification tables.

pub mod keys;
pub mod pkg1;
pub mod pkg2;

/// Keyblob generation indices, named after the first firmware to use them.
pub const KB_100: u8 = 0;
pub const KB_300: u8 = 1;
pub const KB_301: u8 = 2;
pub const KB_400: u8 = 3;
pub const KB_500: u8 = 4;
pub const KB_600: u8 = 5;
pub const KB_620: u8 = 6;
pub const KB_700: u8 = 7;
pub const KB_810: u8 = 8;
pub const KB_900: u8 = 9;
pub const KB_910: u8 = 10;
