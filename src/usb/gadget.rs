//! Linux implementation of the gadget session traits, over configfs USB
//! gadgets and loop devices

use super::{Battery, GadgetDriver, HidDevice, SdEnv, SessionDescriptor, UmsVolume};
use crate::emmc::{file::FileDisk, BlockDev, MmcPartition, SECTOR_SIZE};
use crate::emummc::{self, EmummcConfig};
use crate::progress::{ProgressEvent, Reporter};

use anyhow::Context;
use usb_gadget::{
    default_udc,
    function::{hid::Hid, msd::{Lun, Msd}},
    Class, Config, Gadget, Id, Strings,
};

use std::fs::File;
use std::io::BufRead;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

// Generic gamepad: 16 buttons, two 8-bit axes.
const GAMEPAD_REPORT_DESC: &[u8] = &[
    0x05, 0x01, 0x09, 0x05, 0xA1, 0x01, 0x15, 0x00, 0x25, 0x01, 0x35, 0x00, 0x45, 0x01, 0x75,
    0x01, 0x95, 0x10, 0x05, 0x09, 0x19, 0x01, 0x29, 0x10, 0x81, 0x02, 0x05, 0x01, 0x15, 0x81,
    0x25, 0x7F, 0x75, 0x08, 0x95, 0x02, 0x09, 0x30, 0x09, 0x31, 0x81, 0x02, 0xC0,
];

// Absolute pointer presented as a single-touch digitizer.
const TOUCHPAD_REPORT_DESC: &[u8] = &[
    0x05, 0x0D, 0x09, 0x04, 0xA1, 0x01, 0x09, 0x22, 0xA1, 0x02, 0x09, 0x42, 0x15, 0x00, 0x25,
    0x01, 0x75, 0x01, 0x95, 0x01, 0x81, 0x02, 0x75, 0x07, 0x95, 0x01, 0x81, 0x03, 0x05, 0x01,
    0x09, 0x30, 0x09, 0x31, 0x16, 0x00, 0x00, 0x26, 0xFF, 0x0F, 0x75, 0x10, 0x95, 0x02, 0x81,
    0x02, 0xC0, 0xC0,
];

/// Gadget driver backed by the kernel's configfs gadget interface.
#[derive(Debug)]
pub struct LinuxGadget {
    /// SD card block device node
    sd_dev: PathBuf,
    /// eMMC GPP node; boot partitions append `boot0`/`boot1`
    emmc_dev: PathBuf,
    serial: String,
}

impl LinuxGadget {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(sd_dev: P, emmc_dev: Q, serial: &str) -> Self {
        Self {
            sd_dev: sd_dev.into(),
            emmc_dev: emmc_dev.into(),
            serial: serial.to_string(),
        }
    }

    fn backing_path(&self, volume: UmsVolume) -> PathBuf {
        let emmc_node = |suffix: &str| -> PathBuf {
            let mut p = self.emmc_dev.as_os_str().to_owned();
            p.push(suffix);
            p.into()
        };
        match volume {
            UmsVolume::Sd | UmsVolume::EmuEmmc(_) => self.sd_dev.clone(),
            UmsVolume::Emmc(MmcPartition::Boot0) => emmc_node("boot0"),
            UmsVolume::Emmc(MmcPartition::Boot1) => emmc_node("boot1"),
            UmsVolume::Emmc(MmcPartition::Gpp) => self.emmc_dev.clone(),
        }
    }

    fn register<F>(&self, func: usb_gadget::function::Handle, wait: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        usb_gadget::remove_all().context("cannot remove existing gadgets")?;
        let udc = default_udc().context("cannot get UDC")?;
        let reg = Gadget::new(
            Class::new(0, 0, 0),
            Id::new(0x057E, 0x3000),
            Strings::new("Nintendo", "NX rescue gadget", &self.serial),
        )
        .with_config(Config::new("config").with_function(func))
        .bind(&udc)
        .context("cannot bind to UDC")?;

        let result = wait();
        drop(reg);
        result
    }
}

impl GadgetDriver for LinuxGadget {
    fn run_ums(&mut self, desc: &SessionDescriptor, rpt: &mut dyn Reporter) -> anyhow::Result<()> {
        let path = self.backing_path(desc.volume);

        // Windowed volumes are exposed through a loop device so the host
        // only ever sees the configured range.
        let window = if desc.start_sector != 0 {
            Some(LoopWindow::attach(&path, desc)?)
        } else {
            None
        };
        let expose = window.as_ref().map_or(path.as_path(), |w| w.path());

        let mut lun = Lun::new(expose).context("creating mass-storage LUN")?;
        lun.removable = true;
        lun.read_only = desc.read_only;
        let mut builder = Msd::builder();
        builder.add_lun(lun);
        let (_msd, func) = builder.build();

        rpt.report(ProgressEvent::Status("mass storage exposed, press enter to stop"));
        self.register(func, || wait_for_line(rpt))
    }

    fn run_hid(&mut self, device: HidDevice, rpt: &mut dyn Reporter) -> anyhow::Result<()> {
        let mut builder = Hid::builder();
        builder.protocol = 0;
        builder.sub_class = 0;
        match device {
            HidDevice::Gamepad => {
                builder.report_len = 4;
                builder.report_desc = GAMEPAD_REPORT_DESC.to_vec();
            }
            HidDevice::Touchpad => {
                builder.report_len = 5;
                builder.report_desc = TOUCHPAD_REPORT_DESC.to_vec();
            }
        }
        let (_hid, func) = builder.build();

        rpt.report(ProgressEvent::Status("HID device exposed, press enter to stop"));
        self.register(func, || wait_for_line(rpt))
    }
}

fn wait_for_line(rpt: &mut dyn Reporter) -> anyhow::Result<()> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    rpt.report(ProgressEvent::Status("session ended"));
    Ok(())
}

/// A sector window of a block device, attached to a free loop device for the
/// session's lifetime.
#[derive(Debug)]
struct LoopWindow {
    node: PathBuf,
    file: File,
    // Keeps the backing fd open while the loop device references it.
    _backing: File,
}

impl LoopWindow {
    fn attach(backing: &Path, desc: &SessionDescriptor) -> anyhow::Result<Self> {
        let control = File::open("/dev/loop-control").context("opening /dev/loop-control")?;
        let index = unsafe { ioctl::loop_ctl_get_free(control.as_raw_fd()) }
            .context("allocating a loop device")?;

        let node = PathBuf::from(format!("/dev/loop{index}"));
        let file = File::options().read(true).write(true).open(&node)?;
        let backing = File::options()
            .read(true)
            .write(!desc.read_only)
            .open(backing)?;

        unsafe { ioctl::loop_set_fd(file.as_raw_fd(), backing.as_raw_fd()) }
            .context("attaching the backing device")?;

        let mut info = ioctl::LoopInfo64::default();
        info.lo_offset = desc.start_sector * SECTOR_SIZE as u64;
        info.lo_sizelimit = desc.sector_count * SECTOR_SIZE as u64;
        if let Err(err) = unsafe { ioctl::loop_set_status64(file.as_raw_fd(), &info) } {
            let _ = unsafe { ioctl::loop_clr_fd(file.as_raw_fd()) };
            return Err(err).context("configuring the loop window");
        }

        Ok(Self {
            node,
            file,
            _backing: backing,
        })
    }

    fn path(&self) -> &Path {
        &self.node
    }
}

impl Drop for LoopWindow {
    fn drop(&mut self) {
        let _ = unsafe { ioctl::loop_clr_fd(self.file.as_raw_fd()) };
    }
}

/// SD card reachable through an existing mount point plus its raw device.
#[derive(Debug)]
pub struct HostSd {
    root: PathBuf,
    device: PathBuf,
    disk: Option<FileDisk>,
}

impl HostSd {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(root: P, device: Q) -> Self {
        Self {
            root: root.into(),
            device: device.into(),
            disk: None,
        }
    }
}

impl SdEnv for HostSd {
    fn mount(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.root.is_dir(),
            "SD mount point {} is not a directory",
            self.root.display()
        );
        Ok(())
    }

    fn unmount(&mut self) {
        self.disk = None;
    }

    fn emummc_config(&mut self) -> anyhow::Result<EmummcConfig> {
        let path = self.root.join(emummc::EMUMMC_CONFIG_PATH);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        emummc::parse(&text)
    }

    fn raw(&mut self) -> anyhow::Result<&mut dyn BlockDev> {
        if self.disk.is_none() {
            self.disk = Some(FileDisk::open(&self.device)?);
        }
        Ok(self.disk.as_mut().unwrap())
    }
}

/// Battery gate over the kernel power-supply class.
#[derive(Debug)]
pub struct SysfsBattery {
    pub min_percent: u8,
}

impl Battery for SysfsBattery {
    fn enough_charge(&mut self) -> bool {
        let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") else {
            // No gauge at all (dev boards, PC testing): do not block.
            return true;
        };
        for entry in entries.flatten() {
            let capacity = entry.path().join("capacity");
            if let Ok(text) = std::fs::read_to_string(&capacity) {
                if let Ok(percent) = text.trim().parse::<u8>() {
                    return percent >= self.min_percent;
                }
            }
        }
        true
    }
}

mod ioctl {
    //! The loop-device ioctls

    use nix::{ioctl_none, ioctl_write_int_bad, ioctl_write_ptr_bad};

    ioctl_none!(loop_ctl_get_free, 0x4C, 0x82);
    ioctl_write_int_bad!(loop_set_fd, 0x4C00);
    ioctl_none!(loop_clr_fd, 0x4C, 0x01);
    ioctl_write_ptr_bad!(loop_set_status64, 0x4C04, LoopInfo64);

    /// `struct loop_info64` from the kernel uapi
    #[repr(C)]
    pub struct LoopInfo64 {
        pub lo_device: u64,
        pub lo_inode: u64,
        pub lo_rdevice: u64,
        pub lo_offset: u64,
        pub lo_sizelimit: u64,
        pub lo_number: u32,
        pub lo_encrypt_type: u32,
        pub lo_encrypt_key_size: u32,
        pub lo_flags: u32,
        pub lo_file_name: [u8; 64],
        pub lo_crypt_name: [u8; 64],
        pub lo_encrypt_key: [u8; 32],
        pub lo_init: [u64; 2],
    }

    impl Default for LoopInfo64 {
        fn default() -> Self {
            Self {
                lo_device: 0,
                lo_inode: 0,
                lo_rdevice: 0,
                lo_offset: 0,
                lo_sizelimit: 0,
                lo_number: 0,
                lo_encrypt_type: 0,
                lo_encrypt_key_size: 0,
                lo_flags: 0,
                lo_file_name: [0; 64],
                lo_crypt_name: [0; 64],
                lo_encrypt_key: [0; 32],
                lo_init: [0; 2],
            }
        }
    }
}
