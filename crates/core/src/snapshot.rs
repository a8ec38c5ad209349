//! Snapshot records and the deterministic naming scheme
//!
//! Names look like `<basename>_<YYYYMMDD>_<HHMMSS>[_<NNN>]`. Timestamps are UTC
//! and the optional disambiguator is zero-padded, so for a single watch target
//! lexicographic name order is creation order.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;
const DISAMBIGUATOR_DIGITS: usize = 3;

/// Largest disambiguator that still fits the fixed-width suffix
pub const MAX_DISAMBIGUATOR: u16 = 999;

/// A snapshot that exists (or was just created) in the snapshot directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Directory name inside the snapshot directory
    pub name: String,
    /// Full path of the snapshot
    pub path: PathBuf,
    /// Subvolume the snapshot was taken from
    pub source_path: PathBuf,
    /// Creation time, second precision, parsed back from the name
    pub created_at: DateTime<Utc>,
    /// Disambiguator suffix if two snapshots share a second
    pub disambiguator: Option<u16>,
    /// Size on disk, only filled in when explicitly measured
    pub size_bytes: Option<u64>,
    /// Free-form trigger description (not persisted across listings)
    pub description: Option<String>,
}

impl Snapshot {
    /// Build a record for a snapshot called `name` inside `snapshot_dir`
    pub fn from_name(name: &SnapshotName, snapshot_dir: &Path, source_path: &Path) -> Self {
        let rendered = name.to_string();
        Self {
            path: snapshot_dir.join(&rendered),
            name: rendered,
            source_path: source_path.to_path_buf(),
            created_at: name.created_at(),
            disambiguator: name.disambiguator(),
            size_bytes: None,
            description: None,
        }
    }

    /// Ordering used everywhere snapshots are sorted: creation time, then name
    pub fn chronological(a: &Snapshot, b: &Snapshot) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.disambiguator.cmp(&b.disambiguator))
            .then_with(|| a.name.cmp(&b.name))
    }

    /// Age relative to `now`, clamped at zero
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

/// Parsed form of a snapshot directory name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotName {
    prefix: String,
    created_at: DateTime<Utc>,
    disambiguator: Option<u16>,
}

impl SnapshotName {
    /// Name for a snapshot of a target with the given prefix taken at `at`
    ///
    /// Sub-second precision is dropped.
    pub fn new(prefix: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            created_at: at.trunc_subsecs(0),
            disambiguator: None,
        }
    }

    /// Same name with a disambiguating suffix
    pub fn with_disambiguator(mut self, n: u16) -> Self {
        self.disambiguator = Some(n.min(MAX_DISAMBIGUATOR));
        self
    }

    /// Parse `name` as a snapshot of the target with `prefix`
    ///
    /// Returns `None` for anything that does not follow the naming format
    /// exactly. Foreign directories in the snapshot directory are skipped,
    /// never treated as errors.
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;

        let (stamp, disambiguator) = match rest.len() {
            TIMESTAMP_LEN => (rest, None),
            n if n == TIMESTAMP_LEN + 1 + DISAMBIGUATOR_DIGITS => {
                let (stamp, suffix) = rest.split_at(TIMESTAMP_LEN);
                let digits = suffix.strip_prefix('_')?;
                if !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (stamp, Some(digits.parse::<u16>().ok()?))
            }
            _ => return None,
        };

        // chrono accepts some non-digit padding, so check the shape first
        let shape_ok = stamp.bytes().enumerate().all(|(i, b)| {
            if i == 8 {
                b == b'_'
            } else {
                b.is_ascii_digit()
            }
        });
        if !shape_ok {
            return None;
        }

        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            prefix: prefix.to_string(),
            created_at: Utc.from_utc_datetime(&naive),
            disambiguator,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn disambiguator(&self) -> Option<u16> {
        self.disambiguator
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.prefix,
            self.created_at.format(TIMESTAMP_FORMAT)
        )?;
        if let Some(n) = self.disambiguator {
            write!(f, "_{:0width$}", n, width = DISAMBIGUATOR_DIGITS)?;
        }
        Ok(())
    }
}

/// Snapshot name prefix for a source directory (its basename)
pub fn prefix_for(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "root".to_string())
}
