//! USB gadget sessions: exposing storage volumes and HID devices to a host.
//!
//! The controller here only resolves what to expose (which backing store,
//! where it starts, how large it is, writable or not) and gates the start of
//! a session; the actual gadget plumbing sits behind [`GadgetDriver`].

use crate::emmc::{BlockDev, MmcPartition};
use crate::emummc::EmummcConfig;
use crate::gpt;
use crate::progress::Reporter;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod gadget;

/// Exposed size of the eMMC hardware boot partitions.
pub const EMMC_BOOT_PART_SECTORS: u64 = 0x2000;

/// Sector offsets of the emulated hardware partitions within a raw emuMMC
/// image on the SD card.
const EMU_BOOT0_OFFSET: u64 = 0;
const EMU_BOOT1_OFFSET: u64 = 0x2000;
const EMU_GPP_OFFSET: u64 = 0x4000;

/// Why a mass-storage session could not be assembled
#[derive(Debug, Error)]
pub enum UmsError {
    #[error("failed to mount the SD card")]
    MountFailed,
    #[error("eMMC emulation is disabled in its configuration")]
    EmulationDisabled,
    #[error("eMMC emulation is not sector-based")]
    EmulationNotSectorBased,
}

impl UmsError {
    /// Stable numeric code, kept for status reporting.
    pub fn code(&self) -> u32 {
        match self {
            UmsError::MountFailed => 1,
            UmsError::EmulationDisabled => 2,
            UmsError::EmulationNotSectorBased => 3,
        }
    }
}

/// What a mass-storage session exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmsVolume {
    /// The whole SD card
    Sd,
    /// A hardware partition of the physical eMMC
    Emmc(MmcPartition),
    /// A hardware partition of the emulated eMMC stored on the SD card
    EmuEmmc(MmcPartition),
}

/// A fully-resolved mass-storage session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub volume: UmsVolume,
    /// First backing sector of the exposed window
    pub start_sector: u64,
    /// Sectors exposed; 0 means the whole backing store
    pub sector_count: u64,
    pub read_only: bool,
}

/// HID device classes we can present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidDevice {
    Gamepad,
    Touchpad,
}

/// Runs a prepared session to completion (host eject or cable removal).
pub trait GadgetDriver {
    fn run_ums(&mut self, desc: &SessionDescriptor, rpt: &mut dyn Reporter) -> anyhow::Result<()>;
    fn run_hid(&mut self, device: HidDevice, rpt: &mut dyn Reporter) -> anyhow::Result<()>;
}

/// Access to the SD card needed to resolve emulated-eMMC sessions.
pub trait SdEnv {
    /// Make the SD filesystem reachable
    fn mount(&mut self) -> anyhow::Result<()>;

    fn unmount(&mut self);

    /// Load the emulation configuration from the mounted filesystem
    fn emummc_config(&mut self) -> anyhow::Result<EmummcConfig>;

    /// Raw sector access to the whole SD card
    fn raw(&mut self) -> anyhow::Result<&mut dyn BlockDev>;
}

/// Charge gate consulted before any eMMC-backed session.
pub trait Battery {
    fn enough_charge(&mut self) -> bool;
}

/// No gate; used for SD sessions and in tests.
pub struct NoBatteryGate;

impl Battery for NoBatteryGate {
    fn enough_charge(&mut self) -> bool {
        true
    }
}

/// Descriptor for a session over the whole SD card. Always writable.
pub fn sd_session() -> SessionDescriptor {
    SessionDescriptor {
        volume: UmsVolume::Sd,
        start_sector: 0,
        sector_count: 0,
        read_only: false,
    }
}

/// Descriptor for a session over a physical eMMC hardware partition.
pub fn emmc_session(part: MmcPartition, read_only: bool) -> SessionDescriptor {
    SessionDescriptor {
        volume: UmsVolume::Emmc(part),
        start_sector: 0,
        sector_count: match part {
            MmcPartition::Boot0 | MmcPartition::Boot1 => EMMC_BOOT_PART_SECTORS,
            MmcPartition::Gpp => 0,
        },
        read_only,
    }
}

/// Resolve a session over an emulated eMMC hardware partition.
///
/// The emulated image lives on the SD card at the configured base sector;
/// boot0/boot1 sit at fixed offsets, and the GPP window is sized from the
/// GPT it contains. A GPP without a valid GPT maps to [`UmsError::MountFailed`]
/// since the image is unusable as a disk.
pub fn emu_emmc_session<S: SdEnv>(
    sd: &mut S,
    part: MmcPartition,
    read_only: bool,
) -> Result<SessionDescriptor, UmsError> {
    if sd.mount().is_err() {
        return Err(UmsError::MountFailed);
    }
    let result = resolve_emu(sd, part, read_only);
    sd.unmount();
    result
}

fn resolve_emu<S: SdEnv>(
    sd: &mut S,
    part: MmcPartition,
    read_only: bool,
) -> Result<SessionDescriptor, UmsError> {
    // A missing or unreadable config means emulation was never set up.
    let config = sd
        .emummc_config()
        .unwrap_or_default();
    if !config.enabled {
        return Err(UmsError::EmulationDisabled);
    }
    if !config.sector_based() {
        return Err(UmsError::EmulationNotSectorBased);
    }

    let (offset, sector_count) = match part {
        MmcPartition::Boot0 => (EMU_BOOT0_OFFSET, EMMC_BOOT_PART_SECTORS),
        MmcPartition::Boot1 => (EMU_BOOT1_OFFSET, EMMC_BOOT_PART_SECTORS),
        MmcPartition::Gpp => {
            let base = config.sector + EMU_GPP_OFFSET;
            let raw = sd.raw().map_err(|_| UmsError::MountFailed)?;
            match gpt::probe_backup_lba(raw, base + 1) {
                Ok(Some(sectors)) => (EMU_GPP_OFFSET, sectors),
                // No GPT or unreadable: the image cannot be exposed as a disk.
                Ok(None) | Err(_) => return Err(UmsError::MountFailed),
            }
        }
    };

    Ok(SessionDescriptor {
        volume: UmsVolume::EmuEmmc(part),
        start_sector: config.sector + offset,
        sector_count,
        read_only,
    })
}

/// Resolve and run a mass-storage session for `volume`.
///
/// eMMC-backed volumes (physical and emulated) check the battery gate first
/// and never reach the driver when it fails.
pub fn start_ums<S, B, G, R>(
    volume: UmsVolume,
    read_only: bool,
    sd: &mut S,
    battery: &mut B,
    driver: &mut G,
    rpt: &mut R,
) -> anyhow::Result<()>
where
    S: SdEnv,
    B: Battery,
    G: GadgetDriver,
    R: Reporter,
{
    let desc = match volume {
        UmsVolume::Sd => sd_session(),
        UmsVolume::Emmc(part) => {
            anyhow::ensure!(battery.enough_charge(), "battery charge too low for eMMC session");
            emmc_session(part, read_only)
        }
        UmsVolume::EmuEmmc(part) => {
            anyhow::ensure!(battery.enough_charge(), "battery charge too low for eMMC session");
            emu_emmc_session(sd, part, read_only)?
        }
    };

    driver.run_ums(&desc, rpt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emmc::{SimRegion, SECTOR_SIZE};
    use crate::gpt::fake_gpt;
    use crate::progress::NullReporter;
    use anyhow::Context;

    struct SimSd {
        mountable: bool,
        config: Option<String>,
        disk: SimRegion,
    }

    impl SdEnv for SimSd {
        fn mount(&mut self) -> anyhow::Result<()> {
            anyhow::ensure!(self.mountable, "simulated mount failure");
            Ok(())
        }

        fn unmount(&mut self) {}

        fn emummc_config(&mut self) -> anyhow::Result<EmummcConfig> {
            let text = self.config.as_ref().context("no emummc config")?;
            crate::emummc::parse(text)
        }

        fn raw(&mut self) -> anyhow::Result<&mut dyn BlockDev> {
            Ok(&mut self.disk)
        }
    }

    #[derive(Default)]
    struct CountingDriver {
        ums_runs: u32,
        hid_runs: u32,
    }

    impl GadgetDriver for CountingDriver {
        fn run_ums(
            &mut self,
            _desc: &SessionDescriptor,
            _rpt: &mut dyn Reporter,
        ) -> anyhow::Result<()> {
            self.ums_runs += 1;
            Ok(())
        }

        fn run_hid(&mut self, _device: HidDevice, _rpt: &mut dyn Reporter) -> anyhow::Result<()> {
            self.hid_runs += 1;
            Ok(())
        }
    }

    const EMU_BASE: u64 = 0x8000;

    fn sd_with_emu_image(config: &str, gpt_at_gpp: bool) -> SimSd {
        let mut disk = SimRegion::new(0x20000);
        if gpt_at_gpp {
            // The emulated GPP starts at base + 0x4000; its GPT sits one
            // sector further, where LBA 1 of the emulated disk lands.
            let gpt = fake_gpt(0x4000, &[("PRODINFO", 0x100, 0x1FF)]);
            let base = (EMU_BASE + EMU_GPP_OFFSET) as usize * SECTOR_SIZE;
            disk.bytes_mut()[base..base + gpt.len()].copy_from_slice(&gpt);
        }
        SimSd {
            mountable: true,
            config: Some(config.to_string()),
            disk,
        }
    }

    #[test]
    fn mount_failure_is_code_1() {
        let mut sd = SimSd {
            mountable: false,
            config: None,
            disk: SimRegion::new(1),
        };
        let err = emu_emmc_session(&mut sd, MmcPartition::Boot0, false).unwrap_err();
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn emulation_disabled_is_code_2() {
        let mut sd = sd_with_emu_image("[emummc]\nenabled=0\nsector=0x8000\n", false);
        let err = emu_emmc_session(&mut sd, MmcPartition::Boot0, false).unwrap_err();
        assert_eq!(err.code(), 2);

        // Missing config counts as disabled.
        sd.config = None;
        let err = emu_emmc_session(&mut sd, MmcPartition::Boot0, false).unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn file_based_emulation_is_code_3() {
        let mut sd = sd_with_emu_image("[emummc]\nenabled=1\nsector=0\npath=emuMMC/EF00\n", false);
        let err = emu_emmc_session(&mut sd, MmcPartition::Gpp, false).unwrap_err();
        assert_eq!(err.code(), 3);
    }

    #[test]
    fn failing_sessions_never_reach_the_driver() {
        let mut sd = sd_with_emu_image("[emummc]\nenabled=0\n", false);
        let mut driver = CountingDriver::default();
        let result = start_ums(
            UmsVolume::EmuEmmc(MmcPartition::Boot0),
            false,
            &mut sd,
            &mut NoBatteryGate,
            &mut driver,
            &mut NullReporter,
        );
        assert!(result.is_err());
        assert_eq!(driver.ums_runs, 0);
    }

    #[test]
    fn low_battery_blocks_emmc_sessions() {
        struct Empty;
        impl Battery for Empty {
            fn enough_charge(&mut self) -> bool {
                false
            }
        }

        let mut sd = sd_with_emu_image("[emummc]\nenabled=1\nsector=0x8000\n", false);
        let mut driver = CountingDriver::default();
        let result = start_ums(
            UmsVolume::Emmc(MmcPartition::Boot0),
            true,
            &mut sd,
            &mut Empty,
            &mut driver,
            &mut NullReporter,
        );
        assert!(result.is_err());
        assert_eq!(driver.ums_runs, 0);
    }

    #[test]
    fn emu_windows_and_gpp_sizing() -> anyhow::Result<()> {
        let config = "[emummc]\nenabled=1\nsector=0x8000\npath=emuMMC/ER00\n";

        let mut sd = sd_with_emu_image(config, true);
        let boot1 = emu_emmc_session(&mut sd, MmcPartition::Boot1, true)?;
        assert_eq!(boot1.start_sector, EMU_BASE + 0x2000);
        assert_eq!(boot1.sector_count, EMMC_BOOT_PART_SECTORS);
        assert!(boot1.read_only);

        let gpp = emu_emmc_session(&mut sd, MmcPartition::Gpp, false)?;
        assert_eq!(gpp.start_sector, EMU_BASE + 0x4000);
        // fake_gpt's backup header sits on the last LBA of a 0x4000-sector disk.
        assert_eq!(gpp.sector_count, 0x4000);
        Ok(())
    }

    #[test]
    fn gpp_without_gpt_is_code_1() {
        let config = "[emummc]\nenabled=1\nsector=0x8000\n";
        let mut sd = sd_with_emu_image(config, false);
        let err = emu_emmc_session(&mut sd, MmcPartition::Gpp, false).unwrap_err();
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn raw_emmc_descriptors() {
        let boot0 = emmc_session(MmcPartition::Boot0, true);
        assert_eq!(boot0.sector_count, EMMC_BOOT_PART_SECTORS);
        assert!(boot0.read_only);

        let gpp = emmc_session(MmcPartition::Gpp, false);
        assert_eq!(gpp.sector_count, 0);
        assert_eq!(gpp.start_sector, 0);

        assert!(!sd_session().read_only);
    }
}
