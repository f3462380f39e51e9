//! Migration sources
//!
//! A source produces the ordered list of migration units. [`DirectorySource`]
//! reads `.sql` and `.yaml` files from disk; [`StaticSource`] holds units built
//! in code. Loading has no side effects on the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::definitions::{MigrationUnit, Statement, Version};
use super::sql_split::split_sql_statements;
use crate::error::SourceLoadError;

/// Loads migration units
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// All units, validated and sorted by version
    async fn list_units(&self) -> Result<Vec<MigrationUnit>, SourceLoadError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// `-- Up migration`, `-- down`, `-- Down migration:` ...
static SECTION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^--\s*(up|down)(\s+migration)?\s*:?\s*$").expect("valid section marker regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

/// YAML unit file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitFile {
    name: Option<String>,
    statements: Vec<Statement>,
}

/// A directory of migration files
///
/// File names are `<version>_<name>.sql` (or `.yaml` / `.yml`). A
/// `YYYYMMDD_HHMMSS` prefix is taken as one version. Other files are ignored.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new timestamped migration file and return its path
    pub fn create_migration(&self, name: &str) -> Result<PathBuf, SourceLoadError> {
        fs::create_dir_all(&self.dir).map_err(|e| SourceLoadError::Unreadable {
            path: self.dir.clone(),
            message: format!("failed to create migrations directory: {}", e),
        })?;

        let slug = slugify(name);
        if slug.is_empty() {
            return Err(SourceLoadError::InvalidFileName(name.to_string()));
        }

        let now = Utc::now();
        let version = now.format("%Y%m%d_%H%M%S").to_string();
        let path = self.dir.join(format!("{}_{}.sql", version, slug));
        let template = format!(
            "-- Migration: {}\n\
             -- Version: {}\n\
             -- Created: {}\n\n\
             -- Up migration\n\
             -- Write additive, re-runnable statements (CREATE TABLE IF NOT EXISTS,\n\
             -- INSERT ... ON CONFLICT DO NOTHING). Down sections are not executed.\n\n",
            name,
            version,
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );

        fs::write(&path, template).map_err(|e| SourceLoadError::Unreadable {
            path: path.clone(),
            message: format!("failed to write migration file: {}", e),
        })?;

        Ok(path)
    }

    fn load_file(&self, path: &Path) -> Result<MigrationUnit, SourceLoadError> {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceLoadError::InvalidFileName(path.display().to_string()))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceLoadError::InvalidFileName(file_name.to_string()))?;
        let (version, name) = parse_file_stem(stem)
            .ok_or_else(|| SourceLoadError::InvalidFileName(file_name.to_string()))?;

        let content = fs::read_to_string(path).map_err(|e| SourceLoadError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let is_sql = path.extension().map_or(false, |ext| ext == "sql");
        let unit = if is_sql {
            let up = up_section(&content);
            let statements = split_sql_statements(&up).map_err(|message| {
                SourceLoadError::Malformed {
                    version: version.clone(),
                    message,
                }
            })?;
            MigrationUnit::new(
                version,
                name,
                statements.into_iter().map(Statement::Sql).collect(),
            )
        } else {
            let file: UnitFile =
                serde_yaml::from_str(&content).map_err(|e| SourceLoadError::Malformed {
                    version: version.clone(),
                    message: format!("invalid YAML: {}", e),
                })?;
            MigrationUnit::new(version, file.name.unwrap_or(name), file.statements)
        };

        unit.validate()?;
        Ok(unit)
    }
}

#[async_trait]
impl MigrationSource for DirectorySource {
    async fn list_units(&self) -> Result<Vec<MigrationUnit>, SourceLoadError> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "migrations directory does not exist");
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| SourceLoadError::Unreadable {
            path: self.dir.clone(),
            message: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceLoadError::Unreadable {
                path: self.dir.clone(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            let is_unit = path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| matches!(ext, "sql" | "yaml" | "yml"));
            if is_unit {
                paths.push(path);
            }
        }
        paths.sort();

        let mut units = Vec::with_capacity(paths.len());
        for path in paths {
            units.push((self.load_file(&path)?, path));
        }

        let mut seen: BTreeMap<Version, String> = BTreeMap::new();
        for (unit, path) in &units {
            let file = path.display().to_string();
            if let Some(first) = seen.insert(unit.version().clone(), file.clone()) {
                return Err(SourceLoadError::DuplicateVersion {
                    version: unit.version().clone(),
                    first,
                    second: file,
                });
            }
        }

        let mut units: Vec<MigrationUnit> = units.into_iter().map(|(unit, _)| unit).collect();
        units.sort_by(|a, b| a.version().cmp(b.version()));
        debug!(dir = %self.dir.display(), count = units.len(), "loaded migration units");
        Ok(units)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

/// Units defined in code
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    units: Vec<MigrationUnit>,
}

impl StaticSource {
    pub fn new(units: Vec<MigrationUnit>) -> Result<Self, SourceLoadError> {
        let mut source = Self::default();
        source.extend(units)?;
        Ok(source)
    }

    /// Add units, rejecting any version already present
    pub fn extend(&mut self, units: Vec<MigrationUnit>) -> Result<(), SourceLoadError> {
        for unit in units {
            unit.validate()?;
            if let Some(existing) = self.units.iter().find(|u| u.version() == unit.version()) {
                return Err(SourceLoadError::DuplicateVersion {
                    version: unit.version().clone(),
                    first: existing.name().to_string(),
                    second: unit.name().to_string(),
                });
            }
            self.units.push(unit);
        }
        self.units.sort_by(|a, b| a.version().cmp(b.version()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl MigrationSource for StaticSource {
    async fn list_units(&self) -> Result<Vec<MigrationUnit>, SourceLoadError> {
        Ok(self.units.clone())
    }

    fn describe(&self) -> String {
        format!("{} static units", self.units.len())
    }
}

/// Split `YYYYMMDD_HHMMSS_name` or `version_name` into version and display name
fn parse_file_stem(stem: &str) -> Option<(Version, String)> {
    let parts: Vec<&str> = stem.split('_').collect();
    let is_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    let (version, rest) = if parts.len() >= 3
        && parts[0].len() == 8
        && parts[1].len() == 6
        && is_digits(parts[0])
        && is_digits(parts[1])
    {
        (format!("{}_{}", parts[0], parts[1]), &parts[2..])
    } else if parts.len() >= 2 {
        (parts[0].to_string(), &parts[1..])
    } else {
        return None;
    };

    let name = rest.join(" ").trim().to_string();
    if name.is_empty() {
        return None;
    }

    Version::parse(&version).ok().map(|v| (v, name))
}

/// Text of the up sections; the whole file when there are no markers
fn up_section(content: &str) -> String {
    let has_markers = content
        .lines()
        .any(|line| SECTION_MARKER.is_match(line.trim()));
    if !has_markers {
        return content.to_string();
    }

    let mut section = Section::Preamble;
    let mut up = Vec::new();
    for line in content.lines() {
        if let Some(captures) = SECTION_MARKER.captures(line.trim()) {
            section = if captures[1].eq_ignore_ascii_case("up") {
                Section::Up
            } else {
                Section::Down
            };
            continue;
        }
        if section == Section::Up {
            up.push(line);
        }
    }
    up.join("\n")
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_parse_file_stem() {
        let (version, name) = parse_file_stem("20240101_120000_create_suppliers").unwrap();
        assert_eq!(version.as_str(), "20240101_120000");
        assert_eq!(name, "create suppliers");

        let (version, name) = parse_file_stem("0002_backfill_products").unwrap();
        assert_eq!(version.as_str(), "0002");
        assert_eq!(name, "backfill products");

        assert!(parse_file_stem("nounderscore").is_none());
        assert!(parse_file_stem("0003_").is_none());
    }

    #[test]
    fn test_up_section_ignores_down() {
        let content = "-- Migration: x\n-- Up migration\nCREATE TABLE a (id INT);\n\
                       -- Down migration\nDROP TABLE a;\n";
        let up = up_section(content);
        assert!(up.contains("CREATE TABLE a"));
        assert!(!up.contains("DROP TABLE"));
    }

    #[test]
    fn test_update_comment_is_not_a_marker() {
        let content = "-- update prices for the new supplier\nUPDATE prices SET x = 1;\n";
        assert_eq!(up_section(content), content);
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let source = DirectorySource::new(temp.path().join("absent"));
        assert!(source.list_units().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loads_sql_and_yaml_in_version_order() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "10_add_index.sql",
            "CREATE INDEX IF NOT EXISTS idx_a ON a (id);",
        );
        write(
            temp.path(),
            "2_seed.yaml",
            "name: seed defaults\nstatements:\n  - sql: \"INSERT INTO a VALUES (1) ON CONFLICT DO NOTHING\"\n",
        );
        write(
            temp.path(),
            "1_create.sql",
            "-- Up migration\nCREATE TABLE a (id INT PRIMARY KEY);\nCREATE TABLE b (id INT);\n-- Down migration\nDROP TABLE b;\n",
        );
        write(temp.path(), "README.md", "not a migration");

        let units = DirectorySource::new(temp.path()).list_units().await.unwrap();
        let versions: Vec<&str> = units.iter().map(|u| u.version().as_str()).collect();
        assert_eq!(versions, vec!["1", "2", "10"]);
        assert_eq!(units[0].statements().len(), 2);
        assert_eq!(units[1].name(), "seed defaults");
        assert_eq!(units[2].name(), "add index");
    }

    #[tokio::test]
    async fn test_duplicate_versions_are_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "1_a.sql", "SELECT 1;");
        write(temp.path(), "1_b.sql", "SELECT 2;");

        let err = DirectorySource::new(temp.path())
            .list_units()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceLoadError::DuplicateVersion { .. }));
    }

    #[tokio::test]
    async fn test_malformed_files_are_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "1_bad.yaml", "statements:\n  - drop_everything: true\n");
        let err = DirectorySource::new(temp.path())
            .list_units()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceLoadError::Malformed { .. }));

        let temp = TempDir::new().unwrap();
        write(temp.path(), "nameless.sql", "SELECT 1;");
        let err = DirectorySource::new(temp.path())
            .list_units()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceLoadError::InvalidFileName(_)));

        let temp = TempDir::new().unwrap();
        write(temp.path(), "1_empty.sql", "-- Up migration\n-- nothing yet\n");
        let err = DirectorySource::new(temp.path())
            .list_units()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no statements"));
    }

    #[tokio::test]
    async fn test_create_migration_writes_template() {
        let temp = TempDir::new().unwrap();
        let source = DirectorySource::new(temp.path().join("migrations"));
        let path = source.create_migration("Add Suppliers!").unwrap();

        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.ends_with("_add_suppliers.sql"));
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- Up migration"));
        assert!(content.contains("-- Migration: Add Suppliers!"));
    }

    #[tokio::test]
    async fn test_static_source_rejects_collisions() {
        let unit = |version: &str| {
            MigrationUnit::new(
                Version::parse(version).unwrap(),
                format!("unit {}", version),
                vec![Statement::Sql("SELECT 1".to_string())],
            )
        };

        let mut source = StaticSource::new(vec![unit("3"), unit("1")]).unwrap();
        source.extend(vec![unit("2")]).unwrap();
        let versions: Vec<String> = source
            .list_units()
            .await
            .unwrap()
            .iter()
            .map(|u| u.version().to_string())
            .collect();
        assert_eq!(versions, vec!["1", "2", "3"]);

        assert!(matches!(
            source.extend(vec![unit("2")]),
            Err(SourceLoadError::DuplicateVersion { .. })
        ));
    }
}
