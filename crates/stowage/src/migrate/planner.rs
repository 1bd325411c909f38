use crate::db::{CanonicalState, FileRecord};
use crate::error::{Result, StowageError};
use crate::migrate::template::TemplateResolver;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One planned move of a registered record into the canonical tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovePlan {
    pub file_id: i64,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size_bytes: u64,
    pub category: String,
    pub full_fingerprint: String,
    pub short_id: String,
}

/// Appends `__{short_id}` to the file stem, then a counter, until `taken`
/// reports the path as free. A destination that already carries this
/// record's suffix is re-suffixed from its bare stem.
pub fn disambiguate<F>(destination: &Path, short_id: &str, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    if !taken(destination) {
        return destination.to_path_buf();
    }

    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = bare_stem(&stem, short_id);
    let extension = destination
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let candidate = destination.with_file_name(format!("{}__{}{}", stem, short_id, extension));
    if !taken(&candidate) {
        return candidate;
    }

    let mut n = 2u32;
    loop {
        let candidate =
            destination.with_file_name(format!("{}__{}_{}{}", stem, short_id, n, extension));
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// `stem` without a trailing `__{short_id}` or `__{short_id}_{n}`.
fn bare_stem<'s>(stem: &'s str, short_id: &str) -> &'s str {
    let marker = format!("__{}", short_id);
    match stem.rfind(&marker) {
        Some(at) => {
            let rest = &stem[at + marker.len()..];
            let counter = rest
                .strip_prefix('_')
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            if rest.is_empty() || counter {
                &stem[..at]
            } else {
                stem
            }
        }
        None => stem,
    }
}

pub struct Planner<'a, T: TemplateResolver + ?Sized> {
    templates: &'a T,
    planned: HashSet<PathBuf>,
}

impl<'a, T: TemplateResolver + ?Sized> Planner<'a, T> {
    pub fn new(templates: &'a T) -> Self {
        Self {
            templates,
            planned: HashSet::new(),
        }
    }

    /// Plans one record. Records that are not registered, or lack a category
    /// or full fingerprint, are not movable and yield `None`.
    pub fn plan_record(&mut self, record: &FileRecord) -> Result<Option<MovePlan>> {
        if record.state != CanonicalState::Registered {
            return Ok(None);
        }
        let (Some(category), Some(full)) = (&record.category, &record.full_fingerprint) else {
            return Ok(None);
        };

        let target = self.templates.resolve_template(category, record)?;
        if target == record.current_path {
            log::debug!("File {} already at {}", record.id, target.display());
            return Ok(None);
        }

        let short_id = record.short_id();
        let planned = &self.planned;
        let destination = disambiguate(&target, &short_id, |p| planned.contains(p) || p.exists());
        if destination != target {
            log::info!(
                "Destination {} taken, using {} for file {}",
                target.display(),
                destination.display(),
                record.id
            );
        }
        self.planned.insert(destination.clone());

        Ok(Some(MovePlan {
            file_id: record.id,
            source: record.current_path.clone(),
            destination,
            size_bytes: record.size_bytes,
            category: category.clone(),
            full_fingerprint: full.clone(),
            short_id,
        }))
    }

    /// Plans every movable record. A record whose destination cannot be
    /// resolved is returned with its error and does not stop the batch.
    pub fn plan(&mut self, records: &[FileRecord]) -> (Vec<MovePlan>, Vec<(i64, StowageError)>) {
        let mut plans = Vec::new();
        let mut failures = Vec::new();

        for record in records {
            match self.plan_record(record) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(e) => {
                    log::warn!(
                        "Cannot plan file {} ({}): {}",
                        record.id,
                        record.original_path.display(),
                        e
                    );
                    failures.push((record.id, e));
                }
            }
        }

        log::info!("Planned {} move(s)", plans.len());
        (plans, failures)
    }
}

pub fn total_bytes(plans: &[MovePlan]) -> u64 {
    plans.iter().map(|p| p.size_bytes).sum()
}
