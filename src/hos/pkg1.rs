//! First-stage package: identification table and PK11 unpacking

use super::*;

use anyhow::{ensure, Context};
use deku::prelude::*;

/// Byte offset of the pkg1 region within the BOOT0 partition.
pub const PKG1_OFFSET: u64 = 0x100000;

/// Size of the pkg1 region read for identification and dumping.
pub const PKG1_SIZE: usize = 0x40000;

const BUILD_DATE_OFF: usize = 0x10;
const BUILD_DATE_LEN: usize = 14;

/// One known firmware build of the first-stage package
#[derive(Debug)]
pub struct Pkg1Id {
    /// Build timestamp string found at offset 0x10 ("YYYYMMDDhhmmss")
    pub build_date: &'static str,
    /// Keyblob generation introduced by this build
    pub kb: u8,
    /// Offset of the TSEC firmware blob within pkg1
    pub tsec_off: usize,
    /// Offset of the PK11 container within pkg1
    pub pkg11_off: usize,
    /// Secure monitor load base
    pub secmon_base: u32,
    /// Warmboot blob load base
    pub warmboot_base: u32,
}

static PKG1_IDS: &[Pkg1Id] = &[
    Pkg1Id { build_date: "20161121183008", kb: KB_100, tsec_off: 0x1900, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 1.0.0
    Pkg1Id { build_date: "20170210155124", kb: KB_100, tsec_off: 0x1900, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 2.0.0 - 2.3.0
    Pkg1Id { build_date: "20170519101410", kb: KB_300, tsec_off: 0x1A00, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 3.0.0
    Pkg1Id { build_date: "20170710161758", kb: KB_301, tsec_off: 0x1A00, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 3.0.1 - 3.0.2
    Pkg1Id { build_date: "20170921172629", kb: KB_400, tsec_off: 0x1800, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 4.0.0 - 4.1.0
    Pkg1Id { build_date: "20180220163747", kb: KB_500, tsec_off: 0x1900, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 5.0.0 - 5.1.0
    Pkg1Id { build_date: "20180802162753", kb: KB_600, tsec_off: 0x1900, pkg11_off: 0x3FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 6.0.0 - 6.1.0
    Pkg1Id { build_date: "20181107105733", kb: KB_620, tsec_off: 0x0E00, pkg11_off: 0x6FE0, secmon_base: 0x4002_B000, warmboot_base: 0x8000_D000 }, // 6.2.0
    Pkg1Id { build_date: "20181218175730", kb: KB_700, tsec_off: 0x0F00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 7.0.0
    Pkg1Id { build_date: "20190208150037", kb: KB_700, tsec_off: 0x0F00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 7.0.1
    Pkg1Id { build_date: "20190314172056", kb: KB_700, tsec_off: 0x0E00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 8.0.0 - 8.0.1
    Pkg1Id { build_date: "20190531152432", kb: KB_810, tsec_off: 0x0E00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 8.1.0
    Pkg1Id { build_date: "20190809135709", kb: KB_900, tsec_off: 0x0E00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 9.0.0 - 9.0.1
    Pkg1Id { build_date: "20191021113848", kb: KB_910, tsec_off: 0x0E00, pkg11_off: 0x6FE0, secmon_base: 0x4003_0000, warmboot_base: 0x8000_D000 }, // 9.1.0
];

/// Read the build timestamp string out of a raw pkg1 image.
///
/// The field is plaintext even on encrypted packages, which is what makes
/// identification possible before any key material exists.
pub fn build_date(pkg1: &[u8]) -> Option<String> {
    let raw = pkg1.get(BUILD_DATE_OFF..BUILD_DATE_OFF + BUILD_DATE_LEN)?;
    raw.iter()
        .all(|b| b.is_ascii_digit())
        .then(|| String::from_utf8_lossy(raw).into_owned())
}

/// Identify a pkg1 image against the table of known builds.
pub fn identify(pkg1: &[u8]) -> Option<&'static Pkg1Id> {
    let date = &pkg1.get(BUILD_DATE_OFF..BUILD_DATE_OFF + BUILD_DATE_LEN)?;
    PKG1_IDS
        .iter()
        .find(|id| id.build_date.as_bytes() == *date)
}

pub const PK11_MAGIC: u32 = 0x3131_4B50; // "PK11"

/// Header of the decrypted PK11 container
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Pk11Header {
    pub magic: u32,
    pub wb_size: u32,
    pub wb_off: u32,
    pad: u32,
    pub ldr_size: u32,
    pub ldr_off: u32,
    pub sm_size: u32,
    pub sm_off: u32,
}

pub const PK11_HDR_SIZE: usize = 0x20;

/// The three sections carried by a PK11 container
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Pk11Section {
    Warmboot,
    Loader,
    Secmon,
}

/// Section order inside the container changed with firmware 4.0.0.
fn section_order(kb: u8) -> [Pk11Section; 3] {
    use Pk11Section::*;
    if kb <= KB_301 {
        [Warmboot, Loader, Secmon]
    } else {
        [Loader, Secmon, Warmboot]
    }
}

/// The sub-images split out of one decrypted pkg1
#[derive(Debug)]
pub struct Pkg1Sections<'a> {
    pub header: Pk11Header,
    pub warmboot: &'a [u8],
    pub loader: &'a [u8],
    pub secmon: &'a [u8],
}

/// Split a decrypted pkg1 into its sub-images using the embedded PK11 header.
pub fn unpack<'a>(id: &Pkg1Id, pkg1: &'a [u8]) -> anyhow::Result<Pkg1Sections<'a>> {
    let hdr_off = id.pkg11_off + 0x20;
    let hdr_bytes = pkg1
        .get(hdr_off..hdr_off + PK11_HDR_SIZE)
        .context("pkg1 too short for PK11 header")?;
    let (_, header) = Pk11Header::from_bytes((hdr_bytes, 0))?;
    ensure!(header.magic == PK11_MAGIC, "PK11 magic not found");

    let mut offset = hdr_off + PK11_HDR_SIZE;
    let mut warmboot: &[u8] = &[];
    let mut loader: &[u8] = &[];
    let mut secmon: &[u8] = &[];
    for section in section_order(id.kb) {
        let (size, dst) = match section {
            Pk11Section::Warmboot => (header.wb_size as usize, &mut warmboot),
            Pk11Section::Loader => (header.ldr_size as usize, &mut loader),
            Pk11Section::Secmon => (header.sm_size as usize, &mut secmon),
        };
        *dst = pkg1
            .get(offset..offset + size)
            .context("PK11 section out of bounds")?;
        offset += size;
    }

    Ok(Pkg1Sections {
        header,
        warmboot,
        loader,
        secmon,
    })
}

/// Build a synthetic (already-"decrypted") pkg1 image for tests.
#[cfg(test)]
pub(crate) fn fake_pkg1(id: &Pkg1Id, wb: &[u8], ldr: &[u8], sm: &[u8]) -> Vec<u8> {
    let mut pkg1 = vec![0u8; PKG1_SIZE];
    pkg1[BUILD_DATE_OFF..BUILD_DATE_OFF + BUILD_DATE_LEN]
        .copy_from_slice(id.build_date.as_bytes());

    let hdr = Pk11Header {
        magic: PK11_MAGIC,
        wb_size: wb.len() as u32,
        wb_off: 0,
        pad: 0,
        ldr_size: ldr.len() as u32,
        ldr_off: 0,
        sm_size: sm.len() as u32,
        sm_off: 0,
    };
    let hdr_off = id.pkg11_off + 0x20;
    pkg1[hdr_off..hdr_off + PK11_HDR_SIZE].copy_from_slice(&hdr.to_bytes().unwrap());

    let mut offset = hdr_off + PK11_HDR_SIZE;
    for section in section_order(id.kb) {
        let data = match section {
            Pk11Section::Warmboot => wb,
            Pk11Section::Loader => ldr,
            Pk11Section::Secmon => sm,
        };
        pkg1[offset..offset + data.len()].copy_from_slice(data);
        offset += data.len();
    }
    pkg1
}

/// Look up a table entry by generation, for tests.
#[cfg(test)]
pub(crate) fn identify_by_kb(kb: u8) -> &'static Pkg1Id {
    PKG1_IDS.iter().find(|id| id.kb == kb).unwrap()
}
