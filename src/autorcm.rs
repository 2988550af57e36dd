//! AutoRCM: inspection and toggling of the BOOT0 boot-configuration marker.
//!
//! The boot ROM validates a marker byte inside each of the four BCT copies
//! stored in the eMMC BOOT0 partition. Corrupting the marker makes every cold
//! boot fall through to the recovery mode, which is exactly what AutoRCM
//! wants; restoring the canonical value makes the boot chain normal again.

use crate::emmc::{BlockDev, SECTOR_SIZE};

use anyhow::{ensure, Context};

/// Offset of the marker byte within its sector.
pub const MARKER_OFFSET: usize = 0x10;

/// Sector of the first BCT copy (byte offset 0x200).
const BCT_FIRST_SECTOR: u64 = 0x200 / SECTOR_SIZE as u64;

/// Sector stride between BCT copies (one copy every 0x4000 bytes).
const BCT_STRIDE_SECTORS: u64 = 0x4000 / SECTOR_SIZE as u64;

/// Number of mutually-redundant BCT copies.
pub const BCT_COPIES: u64 = 4;

/// Source of the XOR masks applied when corrupting a marker byte.
///
/// Masks equal to zero are resampled by the engine, so implementations are
/// free to return anything.
pub trait MaskSource {
    fn next_mask(&mut self) -> u8;
}

/// Default mask source: the low byte of a free-running microsecond timer.
pub struct TimerMask;

impl MaskSource for TimerMask {
    fn next_mask(&mut self) -> u8 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_micros() as u8)
            .unwrap_or(0)
    }
}

/// The canonical "AutoRCM disabled" marker value for this hardware revision,
/// derived from the 2-bit ODM fuse field.
pub fn disabled_marker(odm4: u32) -> u8 {
    if (odm4 & 3) != 3 {
        0xF7
    } else {
        0x37
    }
}

/// Report and optionally toggle the AutoRCM state.
///
/// With `change == false` this is a pure probe: one sector read, no writes.
/// With `change == true` all four BCT copies are rewritten to the opposite
/// state and the new state is returned. Enabling XORs a non-zero mask into the
/// marker of each copy; disabling restores the canonical marker, computed once
/// up front so all copies agree.
///
/// Every write is read back and verified; a mismatch aborts with an error
/// naming the failed copy rather than leaving the redundant set silently
/// inconsistent.
pub fn get_status<D, M>(
    boot0: &mut D,
    odm4: u32,
    masks: &mut M,
    change: bool,
) -> anyhow::Result<bool>
where
    D: BlockDev + ?Sized,
    M: MaskSource,
{
    let canonical = disabled_marker(odm4);

    let mut sector_buf = vec![0u8; SECTOR_SIZE];
    boot0.read(BCT_FIRST_SECTOR, &mut sector_buf)?;
    let enabled = sector_buf[MARKER_OFFSET] != canonical;

    if !change {
        return Ok(enabled);
    }

    for copy in 0..BCT_COPIES {
        let sector = BCT_FIRST_SECTOR + copy * BCT_STRIDE_SECTORS;
        boot0
            .read(sector, &mut sector_buf)
            .with_context(|| format!("reading BCT copy {copy}"))?;

        if enabled {
            sector_buf[MARKER_OFFSET] = canonical;
        } else {
            // A zero mask would leave the marker valid; resample until non-zero.
            let mask = loop {
                let mask = masks.next_mask();
                if mask != 0 {
                    break mask;
                }
            };
            sector_buf[MARKER_OFFSET] ^= mask;
        }

        boot0
            .write(sector, &sector_buf)
            .with_context(|| format!("writing BCT copy {copy}"))?;

        // Verify the write actually landed.
        let expected = sector_buf[MARKER_OFFSET];
        boot0.read(sector, &mut sector_buf)?;
        ensure!(
            sector_buf[MARKER_OFFSET] == expected,
            "BCT copy {copy} readback mismatch after write"
        );
    }

    Ok(!enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emmc::SimRegion;

    /// Deterministic mask source for tests; cycles through the given bytes.
    struct FixedMasks(Vec<u8>, usize);

    impl FixedMasks {
        fn new(masks: &[u8]) -> Self {
            Self(masks.to_vec(), 0)
        }
    }

    impl MaskSource for FixedMasks {
        fn next_mask(&mut self) -> u8 {
            let mask = self.0[self.1 % self.0.len()];
            self.1 += 1;
            mask
        }
    }

    fn fresh_boot0(odm4: u32) -> SimRegion {
        let mut region = SimRegion::new(0x100);
        let canonical = disabled_marker(odm4);
        for copy in 0..BCT_COPIES {
            let offset = (0x200 + copy * 0x4000) as usize + MARKER_OFFSET;
            region.bytes_mut()[offset] = canonical;
        }
        region
    }

    fn markers(region: &SimRegion) -> [u8; BCT_COPIES as usize] {
        std::array::from_fn(|i| region.bytes()[0x200 + i * 0x4000 + MARKER_OFFSET])
    }

    #[test]
    fn probe_is_readonly() -> anyhow::Result<()> {
        let mut boot0 = fresh_boot0(0);
        let mut masks = FixedMasks::new(&[0x5A]);

        assert!(!get_status(&mut boot0, 0, &mut masks, false)?);
        assert!(!get_status(&mut boot0, 0, &mut masks, false)?);
        assert_eq!(boot0.writes, 0);
        Ok(())
    }

    #[test]
    fn toggle_round_trip() -> anyhow::Result<()> {
        let mut boot0 = fresh_boot0(0);
        let mut masks = FixedMasks::new(&[0x11, 0x22, 0x33, 0x44]);
        let canonical = disabled_marker(0);

        // Enable: all copies must differ from the canonical byte.
        assert!(get_status(&mut boot0, 0, &mut masks, true)?);
        for marker in markers(&boot0) {
            assert_ne!(marker, canonical);
        }
        assert!(get_status(&mut boot0, 0, &mut masks, false)?);

        // Disable: all copies must be restored to the same canonical byte.
        assert!(!get_status(&mut boot0, 0, &mut masks, true)?);
        assert_eq!(markers(&boot0), [canonical; 4]);
        assert!(!get_status(&mut boot0, 0, &mut masks, false)?);
        Ok(())
    }

    #[test]
    fn zero_masks_are_resampled() -> anyhow::Result<()> {
        let mut boot0 = fresh_boot0(3);
        // Mostly zeros; the engine must skip them and still corrupt the marker.
        let mut masks = FixedMasks::new(&[0, 0, 0, 0x80]);

        assert!(get_status(&mut boot0, 3, &mut masks, true)?);
        let canonical = disabled_marker(3);
        for marker in markers(&boot0) {
            assert_ne!(marker, canonical);
        }
        Ok(())
    }

    #[test]
    fn odm_field_selects_marker() {
        assert_eq!(disabled_marker(0), 0xF7);
        assert_eq!(disabled_marker(2), 0xF7);
        assert_eq!(disabled_marker(3), 0x37);
        assert_eq!(disabled_marker(7), 0x37);
    }
}
