//! Key-material plumbing for the dump engine.
//!
//! Actual cryptography lives outside this crate, behind [`HosCrypto`]; what
//! belongs here is the keyblob geometry, the EKS cache bookkeeping and the
//! handoff used when a newer-generation keygen must run elsewhere.

use super::*;

use anyhow::bail;

/// Byte offset of keyblob 0 within BOOT0; generation `kb` lives one sector
/// further per generation.
pub const KEYBLOB_OFFSET: u64 = 0x180000;

/// Size of one keyblob record.
pub const KEYBLOB_SIZE: usize = 0x200;

/// Sector holding the keyblob for generation `kb`.
pub fn keyblob_sector(kb: u8) -> u64 {
    KEYBLOB_OFFSET / crate::emmc::SECTOR_SIZE as u64 + kb as u64
}

/// External cryptography engine.
///
/// Implementations wrap whatever key derivation hardware or service is
/// available; the dump engine only sequences the calls.
pub trait HosCrypto {
    /// Run keygen for generation `kb` from the raw keyblob and TSEC firmware.
    fn keygen(&mut self, keyblob: &[u8], kb: u8, tsec_fw: &[u8]) -> anyhow::Result<()>;

    /// Decrypt a raw pkg1 image in place-compatible fashion, returning the
    /// plaintext.
    fn decrypt_pkg1(&mut self, id: &pkg1::Pkg1Id, pkg1: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Decrypt a whole encrypted pkg2 image (header included).
    fn decrypt_pkg2(&mut self, pkg2: &[u8], kb: u8) -> anyhow::Result<Vec<u8>>;

    /// Drop any derived session key material.
    fn clear_session_key(&mut self);
}

/// Escape hatch for generations whose keygen cannot run in this process.
///
/// Generations 7.0.0 and newer need a TSEC-assisted keygen that only works
/// from a cold-booted payload; the implementation is expected to stage the
/// request and reboot. It only returns on failure.
pub trait KeygenHandoff {
    fn reboot_to_keygen(&mut self, tsec_fw: &[u8], kb: u8) -> anyhow::Result<()>;
}

/// Cache of encrypted-key-source coverage, persisted across reboots.
///
/// Two slots: one for generations below 8.1.0, one from 8.1.0 up, because the
/// key sources diverged there. A slot records the highest generation whose
/// keys it holds; coverage means the cached material is at least as new as
/// what the current firmware needs, so no keygen handoff is required.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EksCache {
    enabled: [u8; 2],
}

impl EksCache {
    pub fn new(enabled: [u8; 2]) -> Self {
        Self { enabled }
    }

    fn slot(kb: u8) -> usize {
        usize::from(kb >= KB_810)
    }

    /// Does the cache already cover generation `kb`?
    pub fn covers(&self, kb: u8) -> bool {
        self.enabled[Self::slot(kb)] >= kb && self.enabled[Self::slot(kb)] != 0
    }

    /// Record that keys for generation `kb` are now cached.
    pub fn save(&mut self, kb: u8) {
        self.enabled[Self::slot(kb)] = kb;
    }

    /// Invalidate the slot covering generation `kb`.
    ///
    /// Called when a decrypt with cached keys fails, so the next run goes
    /// through a fresh keygen instead of reusing stale material.
    pub fn clear(&mut self, kb: u8) {
        self.enabled[Self::slot(kb)] = 0;
    }
}

/// Placeholder engine for builds without a crypto backend; every call fails.
#[derive(Debug, Default)]
pub struct UnsupportedCrypto;

impl HosCrypto for UnsupportedCrypto {
    fn keygen(&mut self, _keyblob: &[u8], kb: u8, _tsec_fw: &[u8]) -> anyhow::Result<()> {
        bail!("no crypto backend available for keygen (generation {kb})")
    }

    fn decrypt_pkg1(&mut self, _id: &pkg1::Pkg1Id, _pkg1: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("no crypto backend available for pkg1 decryption")
    }

    fn decrypt_pkg2(&mut self, _pkg2: &[u8], _kb: u8) -> anyhow::Result<Vec<u8>> {
        bail!("no crypto backend available for pkg2 decryption")
    }

    fn clear_session_key(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eks_slots_are_independent() {
        let mut eks = EksCache::default();
        assert!(!eks.covers(KB_700));
        assert!(!eks.covers(KB_810));

        eks.save(KB_700);
        assert!(eks.covers(KB_700));
        assert!(!eks.covers(KB_810));

        eks.save(KB_900);
        assert!(eks.covers(KB_810));
        assert!(eks.covers(KB_900));

        // A newer cache entry covers older generations within its slot.
        assert!(eks.covers(KB_700));
        eks.clear(KB_900);
        assert!(!eks.covers(KB_900));
        assert!(eks.covers(KB_700));
    }

    #[test]
    fn keyblob_sectors_step_by_one() {
        assert_eq!(keyblob_sector(KB_100), 0x180000 / 512);
        assert_eq!(keyblob_sector(KB_620), 0x180000 / 512 + 6);
    }
}
