//! Command-line front end for the rescue toolbox.
//!
//! Owns all the presentation concerns: argument parsing, the progress line,
//! the destructive-operation confirmation gate, and wiring the Linux
//! implementations into the capability traits.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nx_rescue::autorcm::{self, TimerMask};
use nx_rescue::dump::{dump_packages, DumpOutcome, DumpSession};
use nx_rescue::emmc::{file::FileEmmc, Emmc, MmcPartition};
use nx_rescue::fsattr::{self, fat::FatFs};
use nx_rescue::hos::keys::{KeygenHandoff, UnsupportedCrypto};
use nx_rescue::output::DirSink;
use nx_rescue::progress::{ProgressEvent, Reporter};
use nx_rescue::usb::{
    gadget::{HostSd, LinuxGadget, SysfsBattery},
    start_ums, HidDevice, UmsVolume,
};
use retry::{delay::Fixed, retry};

use std::path::PathBuf;
use std::sync::{self, atomic};
use std::time::Duration;
use std::{io, thread};

const KEYS_EVDEV_PATH: &str = "/dev/input/event0";

const AUTORCM_WARNING: &str = "\
This will rewrite the boot configuration marker in all four BCT copies of the
eMMC BOOT0 partition. A mistake here can leave the device unable to boot
without recovery tooling.

If you wish to confirm the operation and proceed, either:
1) Type 'CONFIRM' at the below prompt
2) Press the same hardware button three times in a row
";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or toggle the AutoRCM boot marker
    Autorcm {
        /// eMMC device node (GPP; boot nodes are derived from it)
        #[clap(long, default_value = "/dev/mmcblk0")]
        device: PathBuf,

        /// Toggle the marker instead of only reporting it
        #[clap(long)]
        toggle: bool,

        /// Value of the ODM fuse word selecting the canonical marker
        #[clap(long, value_parser = parse_u32, default_value = "0")]
        odm4: u32,

        /// Skip the interactive confirmation gate
        #[clap(long)]
        yes: bool,
    },

    /// Normalize FAT archive attributes beneath a directory tree
    FixArchive {
        /// Root of the mounted SD card (or any vfat tree)
        root: PathBuf,
    },

    /// Dump pkg1/pkg2 firmware packages from an eMMC device
    Dump {
        /// eMMC device node (GPP; boot nodes are derived from it)
        device: PathBuf,

        /// Directory to place the `backup/<serial>/` tree in
        #[clap(long, default_value = ".")]
        out: PathBuf,
    },

    /// Expose a storage volume over USB mass storage
    Ums {
        target: UmsTarget,

        /// Expose the volume read-only
        #[clap(long)]
        read_only: bool,

        /// SD card block device
        #[clap(long, default_value = "/dev/mmcblk1")]
        sd_dev: PathBuf,

        /// Mount point of the SD card filesystem
        #[clap(long, default_value = "/mnt/sd")]
        sd_root: PathBuf,

        /// eMMC device node
        #[clap(long, default_value = "/dev/mmcblk0")]
        emmc_dev: PathBuf,

        /// Minimum battery percentage for eMMC-backed sessions
        #[clap(long, default_value = "30")]
        min_battery: u8,
    },

    /// Expose a HID device over USB
    Hid { kind: HidKind },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UmsTarget {
    Sd,
    EmmcBoot0,
    EmmcBoot1,
    EmmcGpp,
    EmuBoot0,
    EmuBoot1,
    EmuGpp,
}

impl From<UmsTarget> for UmsVolume {
    fn from(target: UmsTarget) -> Self {
        match target {
            UmsTarget::Sd => UmsVolume::Sd,
            UmsTarget::EmmcBoot0 => UmsVolume::Emmc(MmcPartition::Boot0),
            UmsTarget::EmmcBoot1 => UmsVolume::Emmc(MmcPartition::Boot1),
            UmsTarget::EmmcGpp => UmsVolume::Emmc(MmcPartition::Gpp),
            UmsTarget::EmuBoot0 => UmsVolume::EmuEmmc(MmcPartition::Boot0),
            UmsTarget::EmuBoot1 => UmsVolume::EmuEmmc(MmcPartition::Boot1),
            UmsTarget::EmuGpp => UmsVolume::EmuEmmc(MmcPartition::Gpp),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HidKind {
    Gamepad,
    Touchpad,
}

fn parse_u32(value: &str) -> Result<u32, std::num::ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

/// Progress reporting over the terminal status line.
struct ProgressLine {
    rpt: howudoin::Tx,
}

impl ProgressLine {
    fn new(label: &'static str) -> Self {
        Self {
            rpt: howudoin::new().label(label),
        }
    }

    fn finish(self) {
        self.rpt.finish();
    }
}

impl Reporter for ProgressLine {
    fn report(&mut self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::Status(text) => self.rpt.desc(text.to_string()),
            ProgressEvent::Path(path) => self.rpt.desc(path.to_string()),
            ProgressEvent::Saved(name) => self.rpt.add_info(format!("saved {name}")),
            ProgressEvent::Info(text) => self.rpt.add_info(text),
        };
    }

    fn tick(&mut self) {
        self.rpt.inc();
    }
}

fn open_emmc(device: &PathBuf) -> anyhow::Result<FileEmmc> {
    // Device nodes can lag behind hotplug events.
    retry(Fixed::from_millis(100).take(10), || FileEmmc::open(device))
        .map_err(|err| anyhow::anyhow!("{err}"))
        .with_context(|| format!("opening {}", device.display()))
}

/// Wait until the user confirms, through either the prompt or a triple
/// press of a hardware key. One thread per method.
fn wait_for_confirmation() -> bool {
    race_confirmations(confirm_prompt, confirm_keypress)
}

/// Run two confirmation methods on their own threads. The first `true` wins
/// and signals the other to stop; a single `false` (e.g. the input device is
/// absent) leaves the other method running, and only both failing denies.
fn race_confirmations<A, B>(method_a: A, method_b: B) -> bool
where
    A: FnOnce(&atomic::AtomicBool) -> bool + Send + 'static,
    B: FnOnce(&atomic::AtomicBool) -> bool + Send + 'static,
{
    let signals = sync::Arc::new((atomic::AtomicBool::new(false), thread::current()));
    let signals_1 = signals.clone();
    let signals_2 = signals.clone();
    let mut threads = [
        Some(thread::spawn(move || {
            let (stop_flag, main_thread) = &*signals_1;
            let ret = method_a(stop_flag);
            main_thread.unpark();
            ret
        })),
        Some(thread::spawn(move || {
            let (stop_flag, main_thread) = &*signals_2;
            let ret = method_b(stop_flag);
            main_thread.unpark();
            ret
        })),
    ];

    thread::park();

    loop {
        for thread in &mut threads {
            if thread.as_ref().map_or(false, |thread| thread.is_finished()) {
                let ret = thread
                    .take()
                    .unwrap()
                    .join()
                    .expect("thread should not panic");
                // A denial from one method (e.g. no input device present)
                // must not preempt the other; keep waiting on it.
                if ret {
                    signals.0.store(true, atomic::Ordering::Relaxed);
                    return true;
                }
            }
        }
        if threads.iter().all(|thread| thread.is_none()) {
            return false;
        }
        thread::park();
    }
}

fn confirm_prompt(stop_flag: &atomic::AtomicBool) -> bool {
    const CONFIRM_KEYWORD: &str = "CONFIRM";

    let mut input = String::new();
    loop {
        if stop_flag.load(atomic::Ordering::Relaxed) {
            return false;
        }
        eprint!("Type \"{CONFIRM_KEYWORD}\" to continue: ");
        input.clear();
        match io::stdin().read_line(&mut input) {
            Ok(_) if input.trim_end() == CONFIRM_KEYWORD => return true,
            Ok(0) => return false,
            _ => continue,
        };
    }
}

/// Monitor for the same key being pressed three times in short succession.
fn confirm_keypress(stop_flag: &atomic::AtomicBool) -> bool {
    const KEYPRESS_TIMEOUT: Duration = Duration::from_millis(500);
    const KEYPRESS_TIMES: u8 = 3;

    let mut device = match evdev::raw_stream::RawDevice::open(KEYS_EVDEV_PATH) {
        Ok(device) => device,
        Err(_) => return false,
    };

    let mut last_key = None;
    let mut last_time = None;
    let mut times_pressed = 0;

    loop {
        if stop_flag.load(atomic::Ordering::Relaxed) {
            return false;
        }

        let events = match device.fetch_events() {
            Ok(events) => events,
            Err(_) => return false,
        };

        for event in events {
            let key = match event.kind() {
                evdev::InputEventKind::Key(key) => key,
                _ => continue,
            };

            // Switching keys restarts the count.
            if last_key != Some(key) {
                last_key = Some(key);
                times_pressed = 0;
            }

            // Only key-up events count.
            if event.value() != 0 {
                continue;
            }

            let timestamp = event.timestamp();
            let time_elapsed = last_time
                .replace(timestamp)
                .and_then(|x| timestamp.duration_since(x).ok());

            if time_elapsed.map_or(true, |x| x > KEYPRESS_TIMEOUT) {
                times_pressed = 0;
            }

            times_pressed += 1;
            if times_pressed >= KEYPRESS_TIMES {
                return true;
            }
        }
    }
}

/// Keygen handoff is a bootloader-environment facility; from a host OS the
/// dump simply cannot cross that generation boundary.
struct NoHandoff;

impl KeygenHandoff for NoHandoff {
    fn reboot_to_keygen(&mut self, _tsec_fw: &[u8], kb: u8) -> anyhow::Result<()> {
        anyhow::bail!(
            "generation {kb} needs a keygen stage that is unavailable from a host system"
        )
    }
}

fn cmd_autorcm(device: &PathBuf, toggle: bool, odm4: u32, yes: bool) -> anyhow::Result<()> {
    let mut emmc = open_emmc(device)?;
    let mut boot0 = emmc.partition(MmcPartition::Boot0)?;

    if toggle && !yes {
        eprintln!("{AUTORCM_WARNING}");
        anyhow::ensure!(wait_for_confirmation(), "operation not confirmed");
    }

    let enabled = autorcm::get_status(&mut boot0, odm4, &mut TimerMask, toggle)?;
    println!(
        "AutoRCM is now {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn cmd_fix_archive(root: &PathBuf) -> anyhow::Result<()> {
    let mut fs = FatFs::new(root);
    let mut rpt = ProgressLine::new("Fixing archive attributes");
    let totals = fsattr::fix_archive_bits(&mut fs, "", &mut rpt)?;
    rpt.finish();
    println!(
        "Archive attributes fixed: {} set, {} cleared",
        totals.set, totals.cleared
    );
    Ok(())
}

fn cmd_dump(device: &PathBuf, out: &PathBuf) -> anyhow::Result<()> {
    let mut emmc = open_emmc(device)?;
    let mut sink = DirSink::for_device(out, emmc.serial());
    let mut rpt = ProgressLine::new("Dumping firmware packages");

    let mut session = DumpSession::default();
    let outcome = dump_packages(
        &mut emmc,
        &mut session,
        &mut UnsupportedCrypto,
        &mut NoHandoff,
        &mut sink,
        &mut rpt,
    )?;
    rpt.finish();

    match outcome {
        DumpOutcome::Complete => println!("Dump complete under {}", sink.base().display()),
        DumpOutcome::EncryptedPkg1 => println!(
            "Unknown firmware build; encrypted pkg1 saved under {}",
            sink.base().display()
        ),
        DumpOutcome::KeygenHandoff => println!("Keygen handoff requested; rerun after it"),
    }
    Ok(())
}

fn cmd_ums(
    target: UmsTarget,
    read_only: bool,
    sd_dev: &PathBuf,
    sd_root: &PathBuf,
    emmc_dev: &PathBuf,
    min_battery: u8,
) -> anyhow::Result<()> {
    let serial = FileEmmc::open(emmc_dev)
        .map(|emmc| emmc.serial().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut sd = HostSd::new(sd_root, sd_dev);
    let mut battery = SysfsBattery {
        min_percent: min_battery,
    };
    let mut driver = LinuxGadget::new(sd_dev, emmc_dev, &serial);
    let mut rpt = ProgressLine::new("USB mass storage");

    start_ums(
        target.into(),
        read_only,
        &mut sd,
        &mut battery,
        &mut driver,
        &mut rpt,
    )?;
    rpt.finish();
    Ok(())
}

fn cmd_hid(kind: HidKind, sd_dev: &str, emmc_dev: &str) -> anyhow::Result<()> {
    use nx_rescue::usb::GadgetDriver;

    let device = match kind {
        HidKind::Gamepad => HidDevice::Gamepad,
        HidKind::Touchpad => HidDevice::Touchpad,
    };
    let mut driver = LinuxGadget::new(sd_dev, emmc_dev, "0");
    let mut rpt = ProgressLine::new("USB HID");
    driver.run_hid(device, &mut rpt)?;
    rpt.finish();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = match &args.cmd {
        Command::Autorcm {
            device,
            toggle,
            odm4,
            yes,
        } => cmd_autorcm(device, *toggle, *odm4, *yes),
        Command::FixArchive { root } => cmd_fix_archive(root),
        Command::Dump { device, out } => cmd_dump(device, out),
        Command::Ums {
            target,
            read_only,
            sd_dev,
            sd_root,
            emmc_dev,
            min_battery,
        } => cmd_ums(*target, *read_only, sd_dev, sd_root, emmc_dev, *min_battery),
        Command::Hid { kind } => cmd_hid(*kind, "/dev/mmcblk1", "/dev/mmcblk0"),
    };

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failed_method_does_not_deny() {
        // The keypress watcher bails instantly when no input device exists;
        // the prompt must still be able to confirm afterwards.
        let confirmed = race_confirmations(
            |_stop| false,
            |_stop| {
                thread::sleep(Duration::from_millis(20));
                true
            },
        );
        assert!(confirmed);
    }

    #[test]
    fn both_methods_failing_denies() {
        assert!(!race_confirmations(|_stop| false, |_stop| false));
    }

    #[test]
    fn winning_method_stops_the_other() {
        let confirmed = race_confirmations(
            |_stop| true,
            |stop| {
                while !stop.load(atomic::Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                }
                false
            },
        );
        assert!(confirmed);
    }
}
