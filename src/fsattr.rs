//! Repair of FAT archive attributes across an SD card tree.
//!
//! HOS stores some content as "single-file container" folders: a directory
//! holding exactly one file named `00`, which the OS only accepts when the
//! directory carries the archive attribute. Ordinary directories must not
//! carry it. This module walks a tree and normalizes both cases.

use crate::progress::{ProgressEvent, Reporter};

#[cfg(target_os = "linux")]
pub mod fat;

/// Name of the child entry that marks a single-file container folder.
const CONTAINER_CHILD: &str = "00";

/// One enumerated directory entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// Archive attribute, as currently stored
    pub archive: bool,
}

/// Filesystem access needed by the walker.
///
/// Paths are `/`-separated and relative to the filesystem root; the root
/// itself is the empty string.
pub trait DirFs {
    /// Enumerate a directory
    fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>>;

    /// Does an entry exist at this path?
    fn exists(&self, path: &str) -> bool;

    /// Set or clear the archive attribute of a directory
    fn set_archive(&mut self, path: &str, set: bool) -> anyhow::Result<()>;
}

/// Owned path builder with mark/restore semantics.
///
/// Replaces the classic shared scratch buffer: a caller takes a mark before
/// descending and truncates back to it afterwards, which makes sibling-path
/// corruption impossible by construction.
#[derive(Debug)]
pub struct PathStack {
    buf: String,
}

impl PathStack {
    pub fn new(root: &str) -> Self {
        Self {
            buf: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn mark(&self) -> usize {
        self.buf.len()
    }

    pub fn truncate(&mut self, mark: usize) {
        self.buf.truncate(mark);
    }

    pub fn push(&mut self, name: &str) {
        if !self.buf.is_empty() {
            self.buf.push('/');
        }
        self.buf.push_str(name);
    }
}

/// Counters of attribute repairs performed by one walk
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FixTotals {
    /// Archive attributes newly set on container folders
    pub set: u32,
    /// Archive attributes newly cleared from ordinary directories
    pub cleared: u32,
}

/// Recursively normalize archive attributes beneath `root`.
///
/// Reports the running path once per directory visited and yields via
/// [`Reporter::tick`] at the same cadence. The first I/O error aborts the
/// whole walk and propagates; there is no partial-subtree skip.
pub fn fix_archive_bits<F, R>(fs: &mut F, root: &str, rpt: &mut R) -> anyhow::Result<FixTotals>
where
    F: DirFs,
    R: Reporter,
{
    let mut path = PathStack::new(root);
    let mut totals = FixTotals::default();
    walk(fs, &mut path, &mut totals, rpt)?;
    Ok(totals)
}

fn walk<F, R>(
    fs: &mut F,
    path: &mut PathStack,
    totals: &mut FixTotals,
    rpt: &mut R,
) -> anyhow::Result<()>
where
    F: DirFs,
    R: Reporter,
{
    let entries = fs.read_dir(path.as_str())?;

    let mark = path.mark();
    for entry in entries.iter().filter(|e| e.is_dir) {
        path.truncate(mark);
        path.push(&entry.name);

        let probe = path.mark();
        path.push(CONTAINER_CHILD);
        let is_container = fs.exists(path.as_str());
        path.truncate(probe);

        if is_container {
            if !entry.archive {
                totals.set += 1;
                fs.set_archive(path.as_str(), true)?;
            }
        } else if entry.archive {
            totals.cleared += 1;
            fs.set_archive(path.as_str(), false)?;
        }

        rpt.report(ProgressEvent::Path(path.as_str()));
        rpt.tick();

        // Descend regardless of container status.
        walk(fs, path, totals, rpt)?;
    }
    path.truncate(mark);

    Ok(())
}

/// A simulated in-memory filesystem tree, for testing purposes
#[derive(Debug, Default, Clone)]
pub struct SimFs {
    // Full path -> node; directories and files alike
    nodes: std::collections::BTreeMap<String, SimNode>,
}

#[derive(Debug, Clone)]
struct SimNode {
    is_dir: bool,
    archive: bool,
}

impl SimFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&mut self, path: &str, archive: bool) {
        self.nodes
            .insert(path.to_string(), SimNode { is_dir: true, archive });
    }

    pub fn add_file(&mut self, path: &str) {
        self.nodes
            .insert(path.to_string(), SimNode { is_dir: false, archive: false });
    }

    pub fn archive(&self, path: &str) -> Option<bool> {
        self.nodes.get(path).map(|n| n.archive)
    }
}

impl DirFs for SimFs {
    fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            anyhow::ensure!(
                self.nodes.get(path).is_some_and(|n| n.is_dir),
                "not a directory: {path}"
            );
            format!("{path}/")
        };

        Ok(self
            .nodes
            .iter()
            .filter(|(full, _)| {
                full.starts_with(&prefix) && !full[prefix.len()..].contains('/')
            })
            .filter(|(full, _)| full.len() > prefix.len())
            .map(|(full, node)| DirEntry {
                name: full[prefix.len()..].to_string(),
                is_dir: node.is_dir,
                archive: node.archive,
            })
            .collect())
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn set_archive(&mut self, path: &str, set: bool) -> anyhow::Result<()> {
        self.nodes
            .get_mut(path)
            .map(|n| n.archive = set)
            .ok_or_else(|| anyhow::anyhow!("no such entry: {path}"))
    }
}
