//! Destination path templates.
//!
//! Supported placeholders:
//! - `{category}` - classified category
//! - `{year}`, `{month}`, `{day}` - EXIF capture date for images, otherwise
//!   the file's modification time
//! - `{entity}` - sub-entity reported by the classifier
//! - `{name}` - original file name
//! - `{stem}`, `{ext}` - file name without extension, and the extension
//! - `{source}` - last component of the source tree root
//!
//! Any placeholder without a value, including unknown ones, renders as the
//! configured default token.

use crate::config::EngineConfig;
use crate::db::FileRecord;
use crate::error::{Result, StowageError};
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

pub trait TemplateResolver: Send + Sync {
    /// Absolute destination for `record` filed under `category`.
    fn resolve_template(&self, category: &str, record: &FileRecord) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct PathTemplates {
    canonical_root: PathBuf,
    default_template: String,
    templates: BTreeMap<String, String>,
    default_token: String,
}

impl PathTemplates {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            canonical_root: config.canonical_root.clone(),
            default_template: config.default_template.clone(),
            templates: config.templates.clone(),
            default_token: config.default_token.clone(),
        }
    }

    fn template_for(&self, category: &str) -> &str {
        self.templates
            .get(category)
            .map(String::as_str)
            .unwrap_or(&self.default_template)
    }

    fn value_for(&self, key: &str, category: &str, record: &FileRecord, date: Option<NaiveDate>) -> Option<String> {
        match key {
            "category" => Some(category.to_string()),
            "year" => date.map(|d| format!("{:04}", d.year())),
            "month" => date.map(|d| format!("{:02}", d.month())),
            "day" => date.map(|d| format!("{:02}", d.day())),
            "entity" => record.entity.clone(),
            "name" => record.original_path.file_name().map(|n| n.to_string_lossy().to_string()),
            "stem" => record.original_path.file_stem().map(|n| n.to_string_lossy().to_string()),
            "ext" => record.original_path.extension().map(|n| n.to_string_lossy().to_string()),
            "source" => record
                .source_root
                .as_ref()
                .and_then(|root| root.file_name())
                .map(|n| n.to_string_lossy().to_string()),
            _ => None,
        }
    }

    /// Renders `template` into a path relative to the canonical root.
    pub fn render(&self, template: &str, category: &str, record: &FileRecord) -> PathBuf {
        let date = if template.contains("{year}") || template.contains("{month}") || template.contains("{day}") {
            capture_date(record)
        } else {
            None
        };

        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    let value = self
                        .value_for(key, category, record, date)
                        .map(|v| self.sanitize(&v))
                        .unwrap_or_else(|| self.default_token.clone());
                    rendered.push_str(&value);
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        rendered.push_str(rest);

        let mut relative = PathBuf::new();
        for component in Path::new(&rendered).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => relative.push(&self.default_token),
                _ => {}
            }
        }
        if relative.as_os_str().is_empty() {
            relative.push(&self.default_token);
        }
        relative
    }

    /// A substituted value is always a single path component.
    fn sanitize(&self, value: &str) -> String {
        let cleaned: String = value
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | '\0' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
            self.default_token.clone()
        } else {
            cleaned
        }
    }
}

impl TemplateResolver for PathTemplates {
    fn resolve_template(&self, category: &str, record: &FileRecord) -> Result<PathBuf> {
        if category.trim().is_empty() {
            return Err(StowageError::Config(format!(
                "File {} has an empty category",
                record.id
            )));
        }
        let relative = self.render(self.template_for(category), category, record);
        Ok(self.canonical_root.join(relative))
    }
}

/// EXIF capture date for images, else modification time.
fn capture_date(record: &FileRecord) -> Option<NaiveDate> {
    extract_exif_date(&record.current_path).or_else(|| record.modified_at.map(|dt| dt.date_naive()))
}

/// Reads the capture date from an image's EXIF block, if it has one.
pub fn extract_exif_date<P: AsRef<Path>>(path: P) -> Option<NaiveDate> {
    let path = path.as_ref();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let is_image = matches!(
        extension.to_lowercase().as_str(),
        "jpg" | "jpeg" | "png" | "heic" | "heif" | "tiff" | "tif" | "webp"
    );
    if !is_image {
        return None;
    }

    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
        .iter()
        .filter_map(|tag| exif.get_field(*tag, exif::In::PRIMARY))
        .find_map(|field| parse_exif_date(&field.display_value().to_string()))
}

fn parse_exif_date(value: &str) -> Option<NaiveDate> {
    let date = value.trim().trim_matches('"').split_whitespace().next()?;
    let parts: Vec<&str> = date.split(|c| c == ':' || c == '-').collect();
    if parts.len() < 3 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        parts[2].parse().ok()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CanonicalState;
    use chrono::{TimeZone, Utc};

    fn record(path: &str) -> FileRecord {
        FileRecord {
            id: 7,
            original_path: PathBuf::from(path),
            current_path: PathBuf::from(path),
            source_root: Some(PathBuf::from("/drop/laptop")),
            quick_fingerprint: None,
            full_fingerprint: Some("0123456789abcdef".to_string()),
            size_bytes: 1,
            modified_at: Some(Utc.with_ymd_and_hms(2023, 4, 9, 12, 0, 0).unwrap()),
            category: Some("invoice".to_string()),
            entity: Some("ACME Corp".to_string()),
            confidence: Some(0.9),
            method: None,
            source_priority: 1,
            state: CanonicalState::Registered,
            error: None,
            first_seen: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn templates() -> PathTemplates {
        let mut config = EngineConfig::new("/canon", "/backup");
        config.templates.insert(
            "invoice".to_string(),
            "finance/{entity}/{year}/{month}/{name}".to_string(),
        );
        config
            .templates
            .insert("scan".to_string(), "{source}/{stem}-{day}.{ext}".to_string());
        PathTemplates::from_config(&config)
    }

    #[test]
    fn test_category_template() {
        let path = templates()
            .resolve_template("invoice", &record("/drop/laptop/inv-1.pdf"))
            .unwrap();
        insta::assert_snapshot!(path.display().to_string(), @"/canon/finance/ACME Corp/2023/04/inv-1.pdf");
    }

    #[test]
    fn test_default_template_and_parts() {
        let t = templates();
        let r = record("/drop/laptop/notes.txt");
        assert_eq!(
            t.resolve_template("notes", &r).unwrap(),
            PathBuf::from("/canon/notes/notes.txt")
        );
        assert_eq!(
            t.resolve_template("scan", &r).unwrap(),
            PathBuf::from("/canon/laptop/notes-09.txt")
        );
    }

    #[test]
    fn test_missing_values_use_default_token() {
        let mut r = record("/drop/laptop/README");
        r.entity = None;
        r.modified_at = None;
        r.source_root = None;

        let t = templates();
        assert_eq!(
            t.resolve_template("invoice", &r).unwrap(),
            PathBuf::from("/canon/finance/unknown/unknown/unknown/README")
        );
        assert_eq!(
            t.render("{source}/{stem}.{ext}/{bogus}", "scan", &r),
            PathBuf::from("unknown/README.unknown/unknown")
        );
    }

    #[test]
    fn test_values_cannot_escape_root() {
        let mut r = record("/drop/laptop/a.pdf");
        r.entity = Some("../../etc".to_string());
        let path = templates().resolve_template("invoice", &r).unwrap();
        assert!(path.starts_with("/canon/finance"));
        assert_eq!(path, PathBuf::from("/canon/finance/.._.._etc/2023/04/a.pdf"));

        let t = templates();
        assert_eq!(
            t.render("../{category}", "x", &r),
            PathBuf::from("unknown/x")
        );
        assert_eq!(t.render("/abs/{category}", "x", &r), PathBuf::from("abs/x"));
    }

    #[test]
    fn test_parse_exif_date_formats() {
        assert_eq!(
            parse_exif_date("2021:07:04 10:11:12"),
            NaiveDate::from_ymd_opt(2021, 7, 4)
        );
        assert_eq!(
            parse_exif_date("2021-07-04 10:11:12"),
            NaiveDate::from_ymd_opt(2021, 7, 4)
        );
        assert_eq!(parse_exif_date("garbage"), None);
        assert!(extract_exif_date("/no/such/photo.jpg").is_none());
    }

    #[test]
    fn test_empty_category_is_rejected() {
        assert!(templates()
            .resolve_template("  ", &record("/drop/a.pdf"))
            .is_err());
    }
}
