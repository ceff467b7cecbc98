//! Segment parser for migration files
//!
//! A migration file is plain SQL split in two by a fixed marker line:
//!
//! ```text
//! CREATE TABLE users (id SERIAL PRIMARY KEY);
//! -- Down Migration
//! DROP TABLE users;
//! ```
//!
//! Everything before the marker is the up script. Everything after it is the
//! down script, with `/* ... */` block comments removed. No marker, or nothing
//! left after stripping, means the migration is forward-only.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker separating the up and down sections
pub const DOWN_DELIMITER: &str = "-- Down Migration";

static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/\*[\s\S]*?\*/").expect("block comment pattern is valid"));

/// The two halves of a migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments {
    pub up: String,
    pub down: Option<String>,
}

/// Split raw file text into its up and down segments
pub fn parse_segments(raw: &str) -> Segments {
    match raw.split_once(DOWN_DELIMITER) {
        Some((up, down)) => Segments {
            up: up.trim().to_string(),
            down: clean_down(down),
        },
        None => Segments {
            up: raw.trim().to_string(),
            down: None,
        },
    }
}

/// Whether `sql` holds anything besides whitespace and comments
pub fn has_statements(sql: &str) -> bool {
    BLOCK_COMMENT.replace_all(sql, "").lines().any(|line| {
        let code = line.split_once("--").map_or(line, |(code, _)| code);
        !code.trim().is_empty()
    })
}

fn clean_down(segment: &str) -> Option<String> {
    let stripped = BLOCK_COMMENT.replace_all(segment, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
