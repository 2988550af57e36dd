//! Reading the GUID partition table off the eMMC GPP area

use crate::emmc::{read_sectors, BlockDev, SECTOR_SIZE};

use anyhow::{ensure, Context};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// GPT header, LBA 1 of the disk
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc: u32,
    reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc: u32,
}

const GPT_HDR_SIZE: usize = 0x5C;

/// One GPT partition entry
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    name_utf16: [u16; 36],
}

impl GptEntry {
    /// Partition name decoded from its fixed UTF-16LE field.
    pub fn name(&self) -> String {
        let end = self
            .name_utf16
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name_utf16.len());
        String::from_utf16_lossy(&self.name_utf16[..end])
    }

    pub fn sector_count(&self) -> u64 {
        self.last_lba + 1 - self.first_lba
    }
}

/// A parsed and verified partition table
#[derive(Debug)]
pub struct PartitionTable {
    pub header: GptHeader,
    pub entries: Vec<GptEntry>,
}

impl PartitionTable {
    /// Read and verify the primary GPT of a device.
    ///
    /// Both CRCs are checked; a table that fails either is rejected rather
    /// than partially trusted.
    pub fn read<D: BlockDev + ?Sized>(dev: &mut D) -> anyhow::Result<Self> {
        let hdr_sector = read_sectors(dev, 1, 1).context("reading the GPT header")?;
        let (_, header) = GptHeader::from_bytes((&hdr_sector[..GPT_HDR_SIZE], 0))?;
        ensure!(header.signature == GPT_SIGNATURE, "GPT signature not found");
        ensure!(
            header.header_size as usize == GPT_HDR_SIZE,
            "unexpected GPT header size {}",
            header.header_size
        );

        // The header CRC is computed with its own field zeroed.
        let mut hdr_bytes = header.to_bytes()?;
        hdr_bytes[0x10..0x14].fill(0);
        ensure!(
            GPT_CRC.checksum(&hdr_bytes) == header.header_crc,
            "GPT header CRC mismatch"
        );

        let entry_size = header.entry_size as usize;
        ensure!(entry_size >= 0x80, "GPT entry size {entry_size} too small");
        let table_bytes = header.entry_count as usize * entry_size;
        let table_sectors = table_bytes.div_ceil(SECTOR_SIZE);
        let table = read_sectors(dev, header.entries_lba, table_sectors)
            .context("reading the GPT entry array")?;
        ensure!(
            GPT_CRC.checksum(&table[..table_bytes]) == header.entries_crc,
            "GPT entry array CRC mismatch"
        );

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for chunk in table[..table_bytes].chunks_exact(entry_size) {
            let (_, entry) = GptEntry::from_bytes((&chunk[..0x80], 0))?;
            // Unused slots have an all-zero type GUID.
            if entry.type_guid != [0; 16] {
                entries.push(entry);
            }
        }

        Ok(Self { header, entries })
    }

    /// Look up a partition by name.
    pub fn find(&self, name: &str) -> Option<&GptEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }
}

/// Probe `lba` for a GPT header and return the device sector count it
/// implies (`backup_lba + 1`), or `None` when no signature is present.
///
/// Used to size an emulated GPP region whose true extent is unknowable from
/// the host partition alone. I/O errors are distinct from a missing
/// signature and propagate.
pub fn probe_backup_lba<D: BlockDev + ?Sized>(
    dev: &mut D,
    lba: u64,
) -> anyhow::Result<Option<u64>> {
    let sector = read_sectors(dev, lba, 1)?;
    if sector[..8] != GPT_SIGNATURE {
        return Ok(None);
    }
    let (_, header) = GptHeader::from_bytes((&sector[..GPT_HDR_SIZE], 0))?;
    Ok(Some(header.backup_lba + 1))
}

#[cfg(test)]
pub(crate) fn fake_gpt(disk_sectors: u64, parts: &[(&str, u64, u64)]) -> Vec<u8> {
    let entry_size = 0x80usize;
    let entry_count = 128u32;
    let mut table = vec![0u8; entry_count as usize * entry_size];
    for (i, &(name, first, last)) in parts.iter().enumerate() {
        let entry = GptEntry {
            type_guid: [0xAA; 16],
            unique_guid: [i as u8 + 1; 16],
            first_lba: first,
            last_lba: last,
            attributes: 0,
            name_utf16: {
                let mut buf = [0u16; 36];
                for (dst, c) in buf.iter_mut().zip(name.encode_utf16()) {
                    *dst = c;
                }
                buf
            },
        };
        table[i * entry_size..i * entry_size + entry_size]
            .copy_from_slice(&entry.to_bytes().unwrap());
    }

    let mut header = GptHeader {
        signature: GPT_SIGNATURE,
        revision: 0x0001_0000,
        header_size: GPT_HDR_SIZE as u32,
        header_crc: 0,
        reserved: 0,
        current_lba: 1,
        backup_lba: disk_sectors - 1,
        first_usable_lba: 0x22,
        last_usable_lba: disk_sectors - 0x22,
        disk_guid: [0x42; 16],
        entries_lba: 2,
        entry_count,
        entry_size: entry_size as u32,
        entries_crc: GPT_CRC.checksum(&table),
    };
    header.header_crc = GPT_CRC.checksum(&header.to_bytes().unwrap());

    let mut disk = vec![0u8; (disk_sectors as usize) * SECTOR_SIZE];
    disk[SECTOR_SIZE..SECTOR_SIZE + GPT_HDR_SIZE].copy_from_slice(&header.to_bytes().unwrap());
    disk[2 * SECTOR_SIZE..2 * SECTOR_SIZE + table.len()].copy_from_slice(&table);
    disk
}
