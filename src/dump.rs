//! Orchestration of the pkg1/pkg2 firmware dump.
//!
//! Everything the dump needs arrives as a capability: storage, cryptography,
//! the keygen handoff, the output sink and the reporter. The function itself
//! is the state machine only, which is what makes the whole flow testable
//! against simulated devices.

use crate::emmc::{read_sectors, Emmc, MmcPartition, SECTOR_SIZE};
use crate::gpt::PartitionTable;
use crate::hos::keys::{keyblob_sector, EksCache, HosCrypto, KeygenHandoff};
use crate::hos::{pkg1, pkg2, KB_600, KB_620, KB_700};
use crate::output::OutputSink;
use crate::progress::{ProgressEvent, Reporter};

use anyhow::Context;

/// Dump state that survives across boots (keygen status, EKS cache).
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpSession {
    /// Session keys already derived this boot
    pub keygen_done: bool,
    pub eks: EksCache,
}

/// How a dump run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    /// Everything dumpable for this generation was written
    Complete,
    /// Unknown firmware build; only the encrypted pkg1 was written
    EncryptedPkg1,
    /// Control was handed to the external keygen stage; nothing was written
    KeygenHandoff,
}

/// Dump pkg1 and pkg2 of the given device.
///
/// The transient session key is cleared on every exit path once a modern
/// generation has been identified, success and failure alike.
pub fn dump_packages<E, C, H, S, R>(
    emmc: &mut E,
    session: &mut DumpSession,
    crypto: &mut C,
    handoff: &mut H,
    sink: &mut S,
    rpt: &mut R,
) -> anyhow::Result<DumpOutcome>
where
    E: Emmc,
    C: HosCrypto,
    H: KeygenHandoff,
    S: OutputSink,
    R: Reporter,
{
    let mut kb = 0u8;
    let result = run(emmc, session, crypto, handoff, sink, rpt, &mut kb);
    if kb >= KB_620 {
        crypto.clear_session_key();
    }
    result
}

fn save<S, R>(
    sink: &mut S,
    rpt: &mut R,
    subdir: &str,
    name: &str,
    data: &[u8],
) -> anyhow::Result<()>
where
    S: OutputSink,
    R: Reporter,
{
    sink.write_file(subdir, name, data)?;
    rpt.report(ProgressEvent::Saved(&format!("{subdir}/{name}")));
    Ok(())
}

fn run<E, C, H, S, R>(
    emmc: &mut E,
    session: &mut DumpSession,
    crypto: &mut C,
    handoff: &mut H,
    sink: &mut S,
    rpt: &mut R,
    kb: &mut u8,
) -> anyhow::Result<DumpOutcome>
where
    E: Emmc,
    C: HosCrypto,
    H: KeygenHandoff,
    S: OutputSink,
    R: Reporter,
{
    rpt.report(ProgressEvent::Status("reading pkg1"));
    let mut pkg1_buf = {
        let mut boot0 = emmc.partition(MmcPartition::Boot0)?;
        read_sectors(
            &mut boot0,
            pkg1::PKG1_OFFSET / SECTOR_SIZE as u64,
            pkg1::PKG1_SIZE / SECTOR_SIZE,
        )
        .context("reading pkg1 from BOOT0")?
    };
    rpt.tick();

    let Some(id) = pkg1::identify(&pkg1_buf) else {
        // Unknown build: no key derivation is possible, keep the raw image.
        if let Some(date) = pkg1::build_date(&pkg1_buf) {
            rpt.report(ProgressEvent::Info(format!(
                "unknown pkg1 build {date}, dumping encrypted"
            )));
        }
        save(sink, rpt, "pkg1", "pkg1_enc.bin", &pkg1_buf)?;
        return Ok(DumpOutcome::EncryptedPkg1);
    };
    *kb = id.kb;
    rpt.report(ProgressEvent::Info(format!(
        "found pkg1 ('{}'), generation {}",
        id.build_date, id.kb
    )));

    if !session.keygen_done {
        let tsec_fw = &pkg1_buf[id.tsec_off..];

        if id.kb >= KB_700 && !session.eks.covers(id.kb) {
            // Keygen for these generations only runs from a cold boot; on
            // success the handoff reboots and never returns here.
            rpt.report(ProgressEvent::Status("handing off to keygen"));
            handoff
                .reboot_to_keygen(tsec_fw, id.kb)
                .context("keygen handoff")?;
            return Ok(DumpOutcome::KeygenHandoff);
        }

        let keyblob = {
            let mut boot0 = emmc.partition(MmcPartition::Boot0)?;
            read_sectors(&mut boot0, keyblob_sector(id.kb), 1)
                .context("reading keyblob")?
        };
        crypto.keygen(&keyblob, id.kb, tsec_fw)?;
        if id.kb <= KB_600 {
            session.keygen_done = true;
        }
    }
    rpt.tick();

    if id.kb <= KB_600 {
        pkg1_buf = crypto.decrypt_pkg1(id, &pkg1_buf)?;
    }

    if id.kb <= KB_620 {
        let sections = pkg1::unpack(id, &pkg1_buf)?;
        rpt.report(ProgressEvent::Status("dumping pkg1"));
        save(sink, rpt, "pkg1", "pkg1_decr.bin", &pkg1_buf)?;
        save(sink, rpt, "pkg1", "nxloader.bin", sections.loader)?;
        save(sink, rpt, "pkg1", "secmon.bin", sections.secmon)?;
        save(sink, rpt, "pkg1", "warmboot.bin", sections.warmboot)?;
        rpt.tick();
    }

    rpt.report(ProgressEvent::Status("reading pkg2"));
    let pkg2_enc = {
        let mut gpp = emmc.partition(MmcPartition::Gpp)?;
        let table = PartitionTable::read(&mut gpp).context("parsing the GPP GPT")?;
        let Some(part) = table.find(pkg2::PKG2_PARTITION) else {
            rpt.report(ProgressEvent::Info(format!(
                "no {} partition, pkg2 skipped",
                pkg2::PKG2_PARTITION
            )));
            return Ok(DumpOutcome::Complete);
        };

        let base = part.first_lba + pkg2::PKG2_PART_OFFSET / SECTOR_SIZE as u64;
        let hdr_sector = read_sectors(&mut gpp, base, 1)?;
        let size = pkg2::encrypted_size(&hdr_sector)?;
        let aligned = size.next_multiple_of(SECTOR_SIZE);
        read_sectors(&mut gpp, base, aligned / SECTOR_SIZE).context("reading pkg2")?
    };
    rpt.tick();

    let pkg2_buf = match crypto.decrypt_pkg2(&pkg2_enc, id.kb) {
        Ok(plain) => plain,
        Err(err) => {
            // Bad cached keys are the usual culprit; drop them so the next
            // run rederives instead of failing the same way forever.
            session.eks.clear(id.kb);
            return Err(err.context("pkg2 decryption"));
        }
    };
    if id.kb >= KB_700 {
        session.eks.save(id.kb);
    }

    let header = pkg2::parse_header(&pkg2_buf[pkg2::PKG2_SIG_SIZE..])?;
    let kernel_size = header.sec_size[pkg2::PKG2_SEC_KERNEL] as usize;
    let ini1_size = header.sec_size[pkg2::PKG2_SEC_INI1] as usize;
    rpt.report(ProgressEvent::Info(format!(
        "kernel {kernel_size:#x} bytes, INI1 section {ini1_size:#x} bytes"
    )));

    rpt.report(ProgressEvent::Status("dumping pkg2"));
    let data = &pkg2_buf[pkg2::PKG2_SIG_SIZE + pkg2::PKG2_HDR_SIZE..];
    let decr = pkg2_buf
        .get(..kernel_size + ini1_size)
        .context("pkg2 sections larger than the package")?;
    let kernel = data
        .get(..kernel_size)
        .context("kernel section larger than the package")?;
    save(sink, rpt, "pkg2", "pkg2_decr.bin", decr)?;
    save(sink, rpt, "pkg2", "kernel.bin", kernel)?;
    rpt.tick();

    // Newer kernels embed the INI1 pack instead of carrying a section for it.
    let ini1_range = if ini1_size != 0 {
        kernel_size..kernel_size + ini1_size
    } else {
        pkg2::locate_embedded_ini1(data, id.kb).context("locating embedded INI1")?
    };
    let ini1 = data
        .get(ini1_range.clone())
        .with_context(|| format!("INI1 range {ini1_range:?} outside pkg2"))?;
    save(sink, rpt, "pkg2", "ini1.bin", ini1)?;

    let ini1_hdr = pkg2::parse_ini1(ini1)?;
    let mut offset = pkg2::INI1_HDR_SIZE;
    let mut bounce = Vec::new();
    for _ in 0..ini1_hdr.num_procs {
        let kip_hdr = pkg2::parse_kip1(ini1.get(offset..).unwrap_or(&[]))?;
        let size = kip_hdr.blob_size();
        let blob = ini1
            .get(offset..offset + size)
            .with_context(|| format!("KIP {} out of bounds", kip_hdr.name()))?;
        let name = format!("{}.kip1", kip_hdr.name());

        // Interior slices may sit at any offset; the write path wants an
        // 8-byte-aligned buffer, so bounce unaligned blobs through scratch.
        if blob.as_ptr() as usize % 8 != 0 {
            bounce.clear();
            bounce.extend_from_slice(blob);
            save(sink, rpt, "pkg2/ini1", &name, &bounce)?;
        } else {
            save(sink, rpt, "pkg2/ini1", &name, blob)?;
        }
        rpt.tick();
        offset += size;
    }

    Ok(DumpOutcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emmc::SimEmmc;
    use crate::gpt::fake_gpt;
    use crate::hos::pkg1::{fake_pkg1, identify_by_kb};
    use crate::hos::{KB_300, KB_810};
    use crate::output::MemSink;
    use crate::progress::NullReporter;
    use deku::DekuContainerWrite;

    const XOR: u8 = 0x55;

    /// XOR "cipher" over everything but the given plaintext window.
    fn xor_except(buf: &[u8], clear: std::ops::Range<usize>) -> Vec<u8> {
        buf.iter()
            .enumerate()
            .map(|(i, &b)| if clear.contains(&i) { b } else { b ^ XOR })
            .collect()
    }

    #[derive(Default)]
    struct MockCrypto {
        keygens: u32,
        fail_pkg2: bool,
        session_clears: u32,
    }

    impl HosCrypto for MockCrypto {
        fn keygen(&mut self, keyblob: &[u8], _kb: u8, _tsec_fw: &[u8]) -> anyhow::Result<()> {
            anyhow::ensure!(keyblob.len() == SECTOR_SIZE);
            self.keygens += 1;
            Ok(())
        }

        fn decrypt_pkg1(
            &mut self,
            _id: &pkg1::Pkg1Id,
            pkg1: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            // Build date and friends stay plaintext in the real format too.
            Ok(xor_except(pkg1, 0..0x100))
        }

        fn decrypt_pkg2(&mut self, pkg2: &[u8], _kb: u8) -> anyhow::Result<Vec<u8>> {
            anyhow::ensure!(!self.fail_pkg2, "simulated decrypt failure");
            Ok(xor_except(pkg2, 0x100..0x110))
        }

        fn clear_session_key(&mut self) {
            self.session_clears += 1;
        }
    }

    #[derive(Default)]
    struct MockHandoff {
        invocations: u32,
    }

    impl KeygenHandoff for MockHandoff {
        fn reboot_to_keygen(&mut self, _tsec_fw: &[u8], _kb: u8) -> anyhow::Result<()> {
            self.invocations += 1;
            Ok(())
        }
    }

    fn fake_kip(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut header = pkg2::Kip1Header {
            magic: pkg2::KIP1_MAGIC,
            name: [0; 12],
            tid: 0x0100_0000_0000_0000,
            proc_category: 0,
            main_thread_prio: 44,
            default_core: 3,
            reserved: 0,
            flags: 0,
            sections: [(); 6].map(|_| pkg2::KipSection {
                offset: 0,
                size_decomp: 0,
                size_comp: 0,
                attrib: 0,
            }),
            caps: [0; 0x20],
        };
        header.name[..name.len()].copy_from_slice(name.as_bytes());
        header.sections[0].size_comp = payload.len() as u32;
        header.sections[0].size_decomp = payload.len() as u32;

        let mut blob = header.to_bytes().unwrap();
        blob.extend_from_slice(payload);
        blob
    }

    fn fake_ini1(kips: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = kips.concat();
        let header = pkg2::Ini1Header {
            magic: pkg2::INI1_MAGIC,
            size: (pkg2::INI1_HDR_SIZE + body.len()) as u32,
            num_procs: kips.len() as u32,
            pad: 0,
        };
        let mut ini1 = header.to_bytes().unwrap();
        ini1.extend_from_slice(&body);
        ini1
    }

    /// Assemble a decrypted pkg2 image: signature block, header, sections.
    fn fake_pkg2(kernel: &[u8], ini1: &[u8]) -> Vec<u8> {
        let total = pkg2::PKG2_SIG_SIZE + pkg2::PKG2_HDR_SIZE + kernel.len() + ini1.len();

        let mut hdr = vec![0u8; pkg2::PKG2_HDR_SIZE];
        hdr[0..4].copy_from_slice(&(total as u32).to_le_bytes());
        hdr[0x50..0x54].copy_from_slice(&pkg2::PKG2_MAGIC.to_le_bytes());
        hdr[0x60..0x64].copy_from_slice(&(kernel.len() as u32).to_le_bytes());
        hdr[0x64..0x68].copy_from_slice(&(ini1.len() as u32).to_le_bytes());

        let mut pkg2_buf = vec![0u8; pkg2::PKG2_SIG_SIZE];
        pkg2_buf.extend_from_slice(&hdr);
        pkg2_buf.extend_from_slice(kernel);
        pkg2_buf.extend_from_slice(ini1);
        pkg2_buf
    }

    const PKG2_FIRST_LBA: u64 = 0x8000;

    /// A device with a known pkg1 in BOOT0 and an encrypted pkg2 in the GPP.
    fn fake_device(kb: u8, pkg2_plain: Option<&[u8]>) -> SimEmmc {
        let mut emmc = SimEmmc::new(0x2000, 0x10000, "0011223344556677");

        let id = identify_by_kb(kb);
        let pkg1_plain = fake_pkg1(id, &[0xB1; 0x30], &[0xB2; 0x40], &[0xB3; 0x50]);
        let pkg1_enc = if kb <= KB_600 {
            xor_except(&pkg1_plain, 0..0x100)
        } else {
            pkg1_plain
        };
        let boot0 = emmc.region_mut(MmcPartition::Boot0).bytes_mut();
        boot0[pkg1::PKG1_OFFSET as usize..pkg1::PKG1_OFFSET as usize + pkg1::PKG1_SIZE]
            .copy_from_slice(&pkg1_enc);

        let parts: &[(&str, u64, u64)] = match pkg2_plain {
            Some(_) => &[(pkg2::PKG2_PARTITION, PKG2_FIRST_LBA, PKG2_FIRST_LBA + 0xFFF)],
            None => &[("PRODINFO", 0x100, 0x1FF)],
        };
        let gpp = emmc.region_mut(MmcPartition::Gpp).bytes_mut();
        let gpt = fake_gpt(0x10000, parts);
        gpp[..gpt.len()].copy_from_slice(&gpt);

        if let Some(plain) = pkg2_plain {
            let mut enc = xor_except(plain, 0x100..0x110);
            enc.resize(enc.len().next_multiple_of(SECTOR_SIZE), XOR);
            let base =
                PKG2_FIRST_LBA as usize * SECTOR_SIZE + pkg2::PKG2_PART_OFFSET as usize;
            gpp[base..base + enc.len()].copy_from_slice(&enc);
        }

        emmc
    }

    fn run_dump(
        emmc: &mut SimEmmc,
        session: &mut DumpSession,
        crypto: &mut MockCrypto,
        handoff: &mut MockHandoff,
    ) -> (anyhow::Result<DumpOutcome>, MemSink) {
        let mut sink = MemSink::new();
        let result = dump_packages(
            emmc,
            session,
            crypto,
            handoff,
            &mut sink,
            &mut NullReporter,
        );
        (result, sink)
    }

    #[test]
    fn legacy_generation_full_dump() -> anyhow::Result<()> {
        let kernel = vec![0xC0u8; 0x800];
        let ini1 = fake_ini1(&[fake_kip("FS", &[0xD0; 0x28]), fake_kip("Loader", &[0xD1; 0x10])]);
        let pkg2_plain = fake_pkg2(&kernel, &ini1);

        let mut emmc = fake_device(KB_300, Some(&pkg2_plain));
        let mut session = DumpSession::default();
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert_eq!(result?, DumpOutcome::Complete);
        assert_eq!(handoff.invocations, 0);
        assert_eq!(crypto.keygens, 1);
        assert!(session.keygen_done);

        let names: Vec<&str> = sink.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "pkg1/pkg1_decr.bin",
                "pkg1/nxloader.bin",
                "pkg1/secmon.bin",
                "pkg1/warmboot.bin",
                "pkg2/pkg2_decr.bin",
                "pkg2/kernel.bin",
                "pkg2/ini1.bin",
                "pkg2/ini1/FS.kip1",
                "pkg2/ini1/Loader.kip1",
            ]
        );

        assert_eq!(sink.get("pkg1/nxloader.bin"), Some(&[0xB2u8; 0x40][..]));
        assert_eq!(sink.get("pkg2/kernel.bin"), Some(&kernel[..]));
        assert_eq!(sink.get("pkg2/ini1.bin"), Some(&ini1[..]));
        // Legacy generations never hold a transient session key.
        assert_eq!(crypto.session_clears, 0);
        Ok(())
    }

    #[test]
    fn unknown_build_dumps_encrypted_only() -> anyhow::Result<()> {
        let mut emmc = SimEmmc::new(0x2000, 0x10000, "ffffffffffffffff");
        emmc.region_mut(MmcPartition::Boot0).bytes_mut()
            [pkg1::PKG1_OFFSET as usize..pkg1::PKG1_OFFSET as usize + 0x100]
            .fill(0xEE);

        let mut session = DumpSession::default();
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert_eq!(result?, DumpOutcome::EncryptedPkg1);
        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, "pkg1/pkg1_enc.bin");
        assert_eq!(crypto.keygens, 0);
        assert_eq!(handoff.invocations, 0);
        Ok(())
    }

    #[test]
    fn missing_pkg2_partition_keeps_pkg1_files() -> anyhow::Result<()> {
        let mut emmc = fake_device(KB_300, None);
        let mut session = DumpSession::default();
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert_eq!(result?, DumpOutcome::Complete);
        assert_eq!(sink.files.len(), 4);
        assert!(sink.files.iter().all(|(n, _)| n.starts_with("pkg1/")));
        Ok(())
    }

    #[test]
    fn modern_generation_hands_off_keygen() -> anyhow::Result<()> {
        let mut emmc = fake_device(KB_810, None);
        let mut session = DumpSession::default();
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert_eq!(result?, DumpOutcome::KeygenHandoff);
        assert_eq!(handoff.invocations, 1);
        assert_eq!(crypto.keygens, 0);
        assert!(sink.files.is_empty());
        // The modern-generation session key is still cleared on the way out.
        assert_eq!(crypto.session_clears, 1);
        Ok(())
    }

    #[test]
    fn decrypt_failure_clears_eks_slot() {
        let kernel = vec![0xC0u8; 0x200];
        let ini1 = fake_ini1(&[fake_kip("FS", &[0xD0; 8])]);
        let pkg2_plain = fake_pkg2(&kernel, &ini1);

        let mut emmc = fake_device(KB_810, Some(&pkg2_plain));
        let mut session = DumpSession::default();
        session.eks.save(KB_810);
        let mut crypto = MockCrypto {
            fail_pkg2: true,
            ..Default::default()
        };
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert!(result.is_err());
        // Covered EKS slot means no handoff; the failure then invalidates it.
        assert_eq!(handoff.invocations, 0);
        assert!(!session.eks.covers(KB_810));
        assert!(sink.files.is_empty());
        assert_eq!(crypto.session_clears, 1);
    }

    #[test]
    fn oversized_pkg2_sections_error_cleanly() {
        let kernel = vec![0xC0u8; 0x200];
        let ini1 = fake_ini1(&[fake_kip("FS", &[0xD0; 8])]);
        let mut pkg2_plain = fake_pkg2(&kernel, &ini1);
        // A header claiming a kernel far beyond the package must error, not
        // panic, so the session-key cleanup still runs.
        let sec_size = pkg2::PKG2_SIG_SIZE + 0x60;
        pkg2_plain[sec_size..sec_size + 4].copy_from_slice(&0x0010_0000u32.to_le_bytes());

        let mut emmc = fake_device(KB_810, Some(&pkg2_plain));
        let mut session = DumpSession::default();
        session.eks.save(KB_810);
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert!(result.is_err());
        assert!(sink.files.is_empty());
        assert_eq!(crypto.session_clears, 1);
    }

    #[test]
    fn covered_eks_slot_skips_handoff_and_dumps() -> anyhow::Result<()> {
        let kernel = vec![0xC0u8; 0x200];
        let ini1 = fake_ini1(&[fake_kip("FS", &[0xD0; 8])]);
        let pkg2_plain = fake_pkg2(&kernel, &ini1);

        let mut emmc = fake_device(KB_810, Some(&pkg2_plain));
        let mut session = DumpSession::default();
        session.eks.save(KB_810);
        let mut crypto = MockCrypto::default();
        let mut handoff = MockHandoff::default();
        let (result, sink) = run_dump(&mut emmc, &mut session, &mut crypto, &mut handoff);

        assert_eq!(result?, DumpOutcome::Complete);
        assert_eq!(handoff.invocations, 0);
        assert_eq!(crypto.keygens, 1);
        // No pkg1-stage files this far up; straight to the pkg2 set.
        let names: Vec<&str> = sink.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "pkg2/pkg2_decr.bin",
                "pkg2/kernel.bin",
                "pkg2/ini1.bin",
                "pkg2/ini1/FS.kip1",
            ]
        );
        Ok(())
    }
}
