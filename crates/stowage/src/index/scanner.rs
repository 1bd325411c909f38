use crate::config::{EngineConfig, SourceTree};
use crate::db::{CanonicalState, NewFile, Registry};
use crate::error::{Result, StowageError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub bytes_scanned: u64,
    pub new_records: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ScanStats {
    fn merge(&mut self, other: &ScanStats) {
        self.files_scanned += other.files_scanned;
        self.bytes_scanned += other.bytes_scanned;
        self.new_records += other.new_records;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Options for walking source trees
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub include_hidden: bool,
    /// Directories never descended into, such as the canonical and backup
    /// roots when they live inside a source tree
    pub excluded_roots: Vec<PathBuf>,
}

impl ScanOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            include_hidden: config.include_hidden,
            excluded_roots: vec![config.canonical_root.clone(), config.backup_root.clone()],
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded_roots.iter().any(|root| path.starts_with(root))
    }
}

/// Registers every regular file under each source tree with that tree's
/// priority. Unreadable entries are counted and logged; the walk continues.
pub fn scan_source_trees<R: Registry + ?Sized>(
    registry: &mut R,
    trees: &[SourceTree],
    options: &ScanOptions,
) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    for tree in trees {
        match scan_tree(registry, tree, options) {
            Ok(tree_stats) => {
                log::info!(
                    "Scanned {}: {} files, {} new",
                    tree.root.display(),
                    tree_stats.files_scanned,
                    tree_stats.new_records
                );
                stats.merge(&tree_stats);
            }
            Err(e) => {
                log::error!("Failed to scan {}: {}", tree.root.display(), e);
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

pub fn scan_tree<R: Registry + ?Sized>(
    registry: &mut R,
    tree: &SourceTree,
    options: &ScanOptions,
) -> Result<ScanStats> {
    let root = tree.root.as_path();
    if !root.is_dir() {
        return Err(StowageError::FileNotFound(root.to_path_buf()));
    }

    let mut stats = ScanStats::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| keep_entry(entry, root, options));

    for entry in walker {
        match entry {
            Ok(entry) => {
                if let Err(e) = process_entry(registry, tree, &entry, &mut stats) {
                    log::warn!("Error processing {}: {}", entry.path().display(), e);
                    stats.errors += 1;
                }
            }
            Err(e) => {
                log::warn!("Walk error under {}: {}", root.display(), e);
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

fn keep_entry(entry: &DirEntry, root: &Path, options: &ScanOptions) -> bool {
    let path = entry.path();
    if path == root {
        return true;
    }
    if options.is_excluded(path) {
        return false;
    }
    if !options.include_hidden && entry.file_name().to_string_lossy().starts_with('.') {
        return false;
    }
    true
}

fn process_entry<R: Registry + ?Sized>(
    registry: &mut R,
    tree: &SourceTree,
    entry: &DirEntry,
    stats: &mut ScanStats,
) -> Result<()> {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return Ok(());
    }
    if !file_type.is_file() {
        stats.skipped += 1;
        return Ok(());
    }

    let metadata = entry.metadata().map_err(|e| StowageError::Io(e.into()))?;

    let file = NewFile {
        path: entry.path().to_path_buf(),
        size_bytes: metadata.len(),
        source_priority: tree.priority,
        source_root: Some(tree.root.clone()),
        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
    };

    let record = registry.register_file(&file)?;
    stats.files_scanned += 1;
    stats.bytes_scanned += file.size_bytes;
    if record.state == CanonicalState::Pending && record.quick_fingerprint.is_none() {
        stats.new_records += 1;
    }

    Ok(())
}
