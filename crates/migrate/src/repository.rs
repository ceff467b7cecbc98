//! Script Repository - reads migration files from the migrations directory
//!
//! Listing is a pure read: files are re-read on every call and returned in
//! ascending lexical order of their names.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::definitions::MigrationFile;
use crate::error::{MigrationError, MigrationResult};
use crate::parser::{has_statements, parse_segments, DOWN_DELIMITER};

/// File extension recognized as a migration
pub const MIGRATION_EXTENSION: &str = "sql";

/// Directory of versioned migration files
#[derive(Debug, Clone)]
pub struct ScriptRepository {
    dir: PathBuf,
}

impl ScriptRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All migrations in the directory, sorted ascending by name
    pub fn list(&self) -> MigrationResult<Vec<MigrationFile>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| self.discovery_error(source))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| self.discovery_error(source))?;
            let path = entry.path();
            if path.is_file() && has_migration_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut migrations = Vec::with_capacity(paths.len());
        for path in paths {
            let migration = self.read_migration(&path)?;
            if let Some(first) = seen.get(&migration.name) {
                return Err(MigrationError::DuplicateMigration {
                    name: migration.name,
                    first: first.clone(),
                    second: path,
                });
            }
            seen.insert(migration.name.clone(), path);
            migrations.push(migration);
        }

        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(migrations)
    }

    /// Look up a single migration by name
    pub fn find(&self, name: &str) -> MigrationResult<Option<MigrationFile>> {
        Ok(self.list()?.into_iter().find(|m| m.name == name))
    }

    /// Write a new timestamp-prefixed migration file and return its path
    pub fn create(&self, name: &str) -> MigrationResult<PathBuf> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrationError::InvalidMigration {
                path: self.dir.join(name),
                reason: "migration name must contain at least one letter or digit".to_string(),
            });
        }

        fs::create_dir_all(&self.dir).map_err(|source| self.discovery_error(source))?;

        let now = Utc::now();
        let filename = format!(
            "{}_{}.{}",
            now.format("%Y%m%d%H%M%S"),
            slug,
            MIGRATION_EXTENSION
        );
        let path = self.dir.join(filename);
        if path.exists() {
            return Err(MigrationError::AlreadyExists { path });
        }

        let template = format!(
            "-- Migration: {}\n-- Created: {}\n\n\n{}\n",
            slug,
            now.format("%Y-%m-%d %H:%M:%S UTC"),
            DOWN_DELIMITER
        );
        fs::write(&path, template).map_err(|source| MigrationError::Discovery {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    fn read_migration(&self, path: &Path) -> MigrationResult<MigrationFile> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| MigrationError::InvalidMigration {
                path: path.to_path_buf(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let content = fs::read_to_string(path).map_err(|source| MigrationError::Discovery {
            path: path.to_path_buf(),
            source,
        })?;

        let segments = parse_segments(&content);
        if !has_statements(&segments.up) {
            return Err(MigrationError::InvalidMigration {
                path: path.to_path_buf(),
                reason: "up script has no statements".to_string(),
            });
        }

        Ok(MigrationFile {
            name,
            path: path.to_path_buf(),
            up_script: segments.up,
            down_script: segments.down,
        })
    }

    fn discovery_error(&self, source: std::io::Error) -> MigrationError {
        MigrationError::Discovery {
            path: self.dir.clone(),
            source,
        }
    }
}

fn has_migration_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case(MIGRATION_EXTENSION))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}
