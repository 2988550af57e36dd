//! Abstractions and code to access sector-addressed storage (eMMC, SD)

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod file;

/// Sector size of every medium we deal with.
pub const SECTOR_SIZE: usize = 512;

/// The three hardware partitions of an eMMC device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MmcPartition {
    Boot0,
    Boot1,
    Gpp,
}

/// A sector-addressed storage region.
///
/// Buffers passed to `read`/`write` must be a multiple of [`SECTOR_SIZE`].
pub trait BlockDev {
    /// Total number of sectors in this region
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `sector`
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Write whole sectors starting at `sector`
    fn write(&mut self, sector: u64, buf: &[u8]) -> anyhow::Result<()>;
}

impl<T: BlockDev + ?Sized> BlockDev for &mut T {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        (**self).read(sector, buf)
    }
    fn write(&mut self, sector: u64, buf: &[u8]) -> anyhow::Result<()> {
        (**self).write(sector, buf)
    }
}

/// Represents an eMMC device: its three hardware partitions plus the serial
/// number used to key dump output directories.
pub trait Emmc {
    type Part<'a>: BlockDev + 'a
    where
        Self: 'a;

    /// Get access to one of the hardware partitions
    fn partition(&mut self, part: MmcPartition) -> anyhow::Result<Self::Part<'_>>;

    /// Device serial, as printed on dump paths
    fn serial(&self) -> &str;
}

/// Read `count` whole sectors into a fresh buffer.
pub fn read_sectors<D: BlockDev + ?Sized>(
    dev: &mut D,
    sector: u64,
    count: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; count * SECTOR_SIZE];
    dev.read(sector, &mut buf)?;
    Ok(buf)
}

/// A simulated in-memory eMMC, for testing purposes
#[derive(Debug, Clone)]
pub struct SimEmmc {
    boot0: SimRegion,
    boot1: SimRegion,
    gpp: SimRegion,
    serial: String,
}

/// One partition of a [`SimEmmc`] (also usable standalone as a simulated SD
/// card). Counts writes so tests can assert read-only behavior.
#[derive(Debug, Clone)]
pub struct SimRegion {
    data: Vec<u8>,
    /// Number of `write` calls performed against this region
    pub writes: u32,
}

impl SimEmmc {
    /// Create a zero-filled device with `boot_sectors` in each boot partition
    /// and `gpp_sectors` in the general-purpose partition.
    pub fn new(boot_sectors: u64, gpp_sectors: u64, serial: &str) -> Self {
        Self {
            boot0: SimRegion::new(boot_sectors),
            boot1: SimRegion::new(boot_sectors),
            gpp: SimRegion::new(gpp_sectors),
            serial: serial.to_string(),
        }
    }

    pub fn region(&self, part: MmcPartition) -> &SimRegion {
        match part {
            MmcPartition::Boot0 => &self.boot0,
            MmcPartition::Boot1 => &self.boot1,
            MmcPartition::Gpp => &self.gpp,
        }
    }

    pub fn region_mut(&mut self, part: MmcPartition) -> &mut SimRegion {
        match part {
            MmcPartition::Boot0 => &mut self.boot0,
            MmcPartition::Boot1 => &mut self.boot1,
            MmcPartition::Gpp => &mut self.gpp,
        }
    }
}

impl Emmc for SimEmmc {
    type Part<'a> = &'a mut SimRegion;

    fn partition(&mut self, part: MmcPartition) -> anyhow::Result<Self::Part<'_>> {
        Ok(self.region_mut(part))
    }

    fn serial(&self) -> &str {
        &self.serial
    }
}

impl SimRegion {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
            writes: 0,
        }
    }

    /// Wrap pre-built content; the length must be sector-aligned.
    pub fn with_data(data: Vec<u8>) -> Self {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        Self { data, writes: 0 }
    }

    /// Direct access to the backing bytes, for building test fixtures
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, sector: u64, len: usize) -> anyhow::Result<std::ops::Range<usize>> {
        ensure!(len % SECTOR_SIZE == 0, "buffer not a multiple of sector size");
        let begin = sector as usize * SECTOR_SIZE;
        let end = begin + len;
        ensure!(end <= self.data.len(), "sector range {sector}+{len} out of bounds");
        Ok(begin..end)
    }
}

impl BlockDev for SimRegion {
    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> anyhow::Result<()> {
        let range = self.range(sector, buf.len())?;
        self.writes += 1;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}

#[test]
fn test_sim_bounds() {
    let mut region = SimRegion::new(4);
    let mut buf = vec![0u8; SECTOR_SIZE];
    assert!(region.read(3, &mut buf).is_ok());
    assert!(region.read(4, &mut buf).is_err());
    assert!(region.read(0, &mut buf[..10]).is_err());
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut emmc = SimEmmc::new(0x2000, 0x10000, "0123456789");
    let data = vec![0xA5u8; SECTOR_SIZE * 2];

    let mut boot0 = emmc.partition(MmcPartition::Boot0)?;
    boot0.write(7, &data)?;

    let back = read_sectors(&mut boot0, 7, 2)?;
    assert_eq!(back, data);
    assert_eq!(emmc.region(MmcPartition::Boot0).writes, 1);
    assert_eq!(emmc.region(MmcPartition::Boot1).writes, 0);
    Ok(())
}
