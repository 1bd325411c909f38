pub mod dedup;
pub mod hasher;
pub mod scanner;

pub use dedup::{DedupStats, DuplicateResolver, Resolution};
pub use hasher::{full_fingerprint, quick_fingerprint, verify_fingerprint};
pub use scanner::{scan_source_trees, ScanOptions, ScanStats};
