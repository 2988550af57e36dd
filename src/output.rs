//! Destination for dumped artifacts

use anyhow::Context;

use std::path::PathBuf;

/// Somewhere dumped files can be written.
///
/// `subdir` groups related artifacts (e.g. `"pkg1"`, `"pkg2/ini1"`); sinks
/// create it on demand.
pub trait OutputSink {
    fn write_file(&mut self, subdir: &str, name: &str, data: &[u8]) -> anyhow::Result<()>;
}

/// Sink writing beneath `<root>/backup/<serial>/`, the on-card layout dumps
/// have always used.
#[derive(Debug)]
pub struct DirSink {
    base: PathBuf,
}

impl DirSink {
    pub fn for_device<P: Into<PathBuf>>(root: P, serial: &str) -> Self {
        let mut base = root.into();
        base.push("backup");
        base.push(serial);
        Self { base }
    }

    pub fn base(&self) -> &std::path::Path {
        &self.base
    }
}

impl OutputSink for DirSink {
    fn write_file(&mut self, subdir: &str, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let dir = self.base.join(subdir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(name);
        std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))
    }
}

/// An in-memory sink, for testing purposes
#[derive(Debug, Default)]
pub struct MemSink {
    /// `"subdir/name"` keys in write order
    pub files: Vec<(String, Vec<u8>)>,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| data.as_slice())
    }
}

impl OutputSink for MemSink {
    fn write_file(&mut self, subdir: &str, name: &str, data: &[u8]) -> anyhow::Result<()> {
        self.files.push((format!("{subdir}/{name}"), data.to_vec()));
        Ok(())
    }
}
