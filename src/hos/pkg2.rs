//! Second-stage package: header, INI1 process pack and KIP1 records

use super::*;

use anyhow::{ensure, Context};
use deku::prelude::*;

/// Byte offset of the encrypted pkg2 image within its GPP partition.
pub const PKG2_PART_OFFSET: u64 = 0x4000;

/// Name of the GPP partition holding the active pkg2 image.
pub const PKG2_PARTITION: &str = "BCPKG2-1-Normal-Main";

pub const PKG2_MAGIC: u32 = 0x3132_4B50; // "PK21"

/// Size of the signature block preceding the header in a raw package.
pub const PKG2_SIG_SIZE: usize = 0x100;

/// Size of the pkg2 header, which doubles as the section data offset.
pub const PKG2_HDR_SIZE: usize = 0x100;

pub const PKG2_SEC_KERNEL: usize = 0;
pub const PKG2_SEC_INI1: usize = 1;

/// Decrypted pkg2 header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Pkg2Header {
    pub ctr: [u8; 0x10],
    pub sec_ctr: [u8; 0x40],
    pub magic: u32,
    pub base: u32,
    pad0: u32,
    pub version: u16,
    pad1: u16,
    pub sec_size: [u32; 4],
    pub sec_off: [u32; 4],
    pub sec_sha256: [u8; 0x80],
}

/// Recover the total encrypted pkg2 size from a still-encrypted header sector.
///
/// The CTR prefix of the header doubles as a size field: the first, third and
/// fourth little-endian words at 0x100 XOR together to the byte count of the
/// whole package, header included. This works before any decryption because
/// the CTR itself is stored in the clear.
pub fn encrypted_size(hdr_sector: &[u8]) -> anyhow::Result<usize> {
    ensure!(
        hdr_sector.len() >= 0x110,
        "header sector too short for the pkg2 size words"
    );
    let word = |off: usize| {
        u32::from_le_bytes(hdr_sector[off..off + 4].try_into().unwrap())
    };
    let size = word(0x100) ^ word(0x108) ^ word(0x10C);
    ensure!(
        size as usize > PKG2_HDR_SIZE,
        "implausible pkg2 size {size:#x}"
    );
    Ok(size as usize)
}

/// Parse a decrypted pkg2 header and validate its magic.
pub fn parse_header(pkg2: &[u8]) -> anyhow::Result<Pkg2Header> {
    let bytes = pkg2
        .get(..PKG2_HDR_SIZE)
        .context("pkg2 too short for its header")?;
    let (_, header) = Pkg2Header::from_bytes((bytes, 0))?;
    ensure!(header.magic == PKG2_MAGIC, "PK21 magic not found");
    Ok(header)
}

impl Pkg2Header {
    /// Byte range of a section within the decrypted package.
    pub fn section(&self, index: usize) -> std::ops::Range<usize> {
        let start: usize = PKG2_HDR_SIZE
            + self.sec_size[..index]
                .iter()
                .map(|&s| s as usize)
                .sum::<usize>();
        start..start + self.sec_size[index] as usize
    }
}

pub const INI1_MAGIC: u32 = 0x3149_4E49; // "INI1"
pub const INI1_HDR_SIZE: usize = 0x10;

/// Header of the INI1 initial-process pack
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Ini1Header {
    pub magic: u32,
    pub size: u32,
    pub num_procs: u32,
    pub pad: u32,
}

/// Parse and validate an INI1 header at the start of `ini1`.
pub fn parse_ini1(ini1: &[u8]) -> anyhow::Result<Ini1Header> {
    let bytes = ini1
        .get(..INI1_HDR_SIZE)
        .context("INI1 blob too short for its header")?;
    let (_, header) = Ini1Header::from_bytes((bytes, 0))?;
    ensure!(header.magic == INI1_MAGIC, "INI1 magic not found");
    Ok(header)
}

pub const KIP1_MAGIC: u32 = 0x3150_494B; // "KIP1"
pub const KIP1_HDR_SIZE: usize = 0x100;

/// One section descriptor inside a KIP1 header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
pub struct KipSection {
    pub offset: u32,
    pub size_decomp: u32,
    pub size_comp: u32,
    pub attrib: u32,
}

/// Header of one KIP1 initial-process record
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Kip1Header {
    pub magic: u32,
    pub name: [u8; 12],
    pub tid: u64,
    pub proc_category: u32,
    pub main_thread_prio: u8,
    pub default_core: u8,
    pub reserved: u8,
    pub flags: u8,
    pub sections: [KipSection; 6],
    pub caps: [u32; 0x20],
}

impl Kip1Header {
    /// Process name with trailing NULs stripped.
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Total on-disk size of this KIP record: header plus compressed sections.
    pub fn blob_size(&self) -> usize {
        KIP1_HDR_SIZE
            + self
                .sections
                .iter()
                .map(|s| s.size_comp as usize)
                .sum::<usize>()
    }
}

/// Parse and validate a KIP1 header at the start of `kip`.
pub fn parse_kip1(kip: &[u8]) -> anyhow::Result<Kip1Header> {
    let bytes = kip
        .get(..KIP1_HDR_SIZE)
        .context("KIP1 record out of bounds")?;
    let (_, header) = Kip1Header::from_bytes((bytes, 0))?;
    ensure!(header.magic == KIP1_MAGIC, "KIP1 magic not found");
    Ok(header)
}

// AArch64 "mov w21, #0" followed, within the window, by the kernel-info load
// whose immediate locates the embedded INI1 bounds.
const KERNEL_SCAN_MARKER: u32 = 0xD280_0015;
const KERNEL_SCAN_WINDOW: usize = 0x100;

/// Locate the INI1 pack embedded in a monolithic kernel image.
///
/// Firmware 8.0.0 dropped the separate INI1 section from the pkg2 header and
/// embeds the pack inside the kernel instead. The kernel carries no pointer
/// table we can trust across builds, so this scans for the marker instruction
/// and decodes the adjacent kernel-info structure. The scan table is keyed by
/// generation so new layouts extend it rather than loosening the heuristic.
pub fn locate_embedded_ini1(kernel: &[u8], kb: u8) -> anyhow::Result<std::ops::Range<usize>> {
    // All known generations from 8.0.0 onwards share one layout.
    ensure!(kb >= KB_700, "kernel for generation {kb} carries no embedded INI1");

    let word = |off: usize| -> Option<u32> {
        kernel
            .get(off..off + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    };

    for off in (0..KERNEL_SCAN_WINDOW.min(kernel.len())).step_by(4) {
        if word(off) != Some(KERNEL_SCAN_MARKER) {
            continue;
        }
        let info_op = word(off + 12).context("kernel truncated inside the scan window")?;
        let val = ((info_op & 0xFFFF) >> 3) as usize + off + 12;

        let start = word(val).context("kernel-info start out of bounds")? as usize;
        let end = word(val + 8).context("kernel-info end out of bounds")? as usize;
        ensure!(
            start < end && end <= kernel.len(),
            "kernel-info bounds {start:#x}..{end:#x} out of range"
        );
        return Ok(start..end);
    }

    anyhow::bail!("embedded INI1 marker not found in kernel image")
}
