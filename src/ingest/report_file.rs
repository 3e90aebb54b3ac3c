//! Parsing of vendor SMR report exports.
//!
//! Two concerns live here:
//! - filename metadata: report week/year are encoded in the export filename
//!   (`<report> - <week>-<year> Top 200.csv`)
//! - row parsing: vendor CSVs name the required columns inconsistently and
//!   in varying order, so headers are mapped through an alias table before
//!   any row is read.

use anyhow::{bail, Context, Result};
use csv::StringRecord;
use regex::Regex;
use std::path::Path;
use thiserror::Error;

/// Week/year metadata extracted from an export filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFilename {
    pub report_name: String,
    pub week: u32,
    pub year: i32,
}

impl ReportFilename {
    /// Parse `<report> - <week>-<year> Top 200.csv`.
    ///
    /// Returns None for filenames that do not match the vendor convention;
    /// the ingestor skips those files.
    pub fn parse(file_name: &str) -> Option<Self> {
        // Compiled per call; ingestion runs over at most a few hundred files.
        let re = Regex::new(r"(?i)^(.+?)\s*-\s*(\d{1,2})-(\d{4})\s+top\s*\d+\.csv$")
            .expect("invalid report filename regex");
        let caps = re.captures(file_name)?;
        let week: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        if !(1..=53).contains(&week) {
            return None;
        }
        Some(Self {
            report_name: caps[1].trim().to_string(),
            week,
            year,
        })
    }

    pub fn parse_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse)
    }
}

/// Positions of the required columns within a vendor CSV.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    artist: usize,
    track: usize,
    spins: usize,
    prior_spins: usize,
    reach: usize,
    label: usize,
    rank: usize,
}

/// Alias tables for vendor header spellings, all compared case-insensitively.
const ARTIST_ALIASES: &[&str] = &["artist", "artist name"];
const TRACK_ALIASES: &[&str] = &["track", "title", "song", "track title"];
const SPINS_ALIASES: &[&str] = &["spins", "spins tw", "this week", "tw spins"];
const PRIOR_SPINS_ALIASES: &[&str] = &["prior spins", "spins lw", "last week", "lw spins"];
const REACH_ALIASES: &[&str] = &["reach", "stations", "station count"];
const LABEL_ALIASES: &[&str] = &["label", "record label"];
const RANK_ALIASES: &[&str] = &["rank", "pos", "position", "tw"];

fn find_column(headers: &StringRecord, aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        aliases.iter().any(|a| *a == h)
    })
}

impl ColumnMap {
    /// Build the column map from a header record.
    ///
    /// Fails when any required column is missing entirely; that aborts the
    /// file (not the run), since no row could ever be parsed.
    pub fn from_headers(headers: &StringRecord) -> Result<Self> {
        let lookup = |name: &str, aliases: &[&str]| {
            find_column(headers, aliases)
                .with_context(|| format!("report header is missing a '{}' column", name))
        };
        Ok(Self {
            artist: lookup("artist", ARTIST_ALIASES)?,
            track: lookup("track", TRACK_ALIASES)?,
            spins: lookup("spins", SPINS_ALIASES)?,
            prior_spins: lookup("prior spins", PRIOR_SPINS_ALIASES)?,
            reach: lookup("reach", REACH_ALIASES)?,
            label: lookup("label", LABEL_ALIASES)?,
            rank: lookup("rank", RANK_ALIASES)?,
        })
    }
}

/// One successfully parsed report row, not yet resolved to any entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub artist: String,
    pub track: String,
    pub label: Option<String>,
    pub spins: i64,
    pub prior_spins: Option<i64>,
    pub reach: i64,
    pub rank_position: Option<i64>,
}

/// Row-level parse failure. Logged and skipped, never fatal to the run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row has fewer fields than the header")]
    TooShort,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is not a number: '{value}'")]
    NotANumber { field: &'static str, value: String },
    #[error("field '{field}' must be non-negative, got {value}")]
    NegativeCount { field: &'static str, value: i64 },
}

fn required_text(record: &StringRecord, idx: usize, field: &'static str) -> Result<String, RowError> {
    let value = record.get(idx).ok_or(RowError::TooShort)?.trim();
    if value.is_empty() {
        return Err(RowError::MissingField(field));
    }
    Ok(value.to_string())
}

fn required_number(record: &StringRecord, idx: usize, field: &'static str) -> Result<i64, RowError> {
    let value = record.get(idx).ok_or(RowError::TooShort)?.trim();
    if value.is_empty() {
        return Err(RowError::MissingField(field));
    }
    // Vendors format counts with thousands separators.
    value
        .replace(',', "")
        .parse()
        .map_err(|_| RowError::NotANumber {
            field,
            value: value.to_string(),
        })
}

fn optional_number(record: &StringRecord, idx: usize) -> Option<i64> {
    record
        .get(idx)
        .map(|v| v.trim().replace(',', ""))
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

impl ReportRow {
    /// Parse one CSV record using the header map.
    ///
    /// Artist, track, current spins and reach are required; negative spin
    /// or reach counts are rejected. Label, prior spins and rank position
    /// are carried through when present and silently dropped when not.
    pub fn parse(map: &ColumnMap, record: &StringRecord) -> Result<Self, RowError> {
        let artist = required_text(record, map.artist, "artist")?;
        let track = required_text(record, map.track, "track")?;
        let spins = required_number(record, map.spins, "spins")?;
        let reach = required_number(record, map.reach, "reach")?;
        if spins < 0 {
            return Err(RowError::NegativeCount {
                field: "spins",
                value: spins,
            });
        }
        if reach < 0 {
            return Err(RowError::NegativeCount {
                field: "reach",
                value: reach,
            });
        }

        let label = record
            .get(map.label)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self {
            artist,
            track,
            label,
            spins,
            prior_spins: optional_number(record, map.prior_spins),
            reach,
            rank_position: optional_number(record, map.rank),
        })
    }
}

/// Open a report CSV and return its reader plus resolved column map.
pub fn open_report(path: &Path) -> Result<(csv::Reader<std::fs::File>, ColumnMap)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open report file {:?}", path))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read headers of {:?}", path))?
        .clone();
    if headers.is_empty() {
        bail!("report file {:?} has no header row", path);
    }
    let map = ColumnMap::from_headers(&headers)
        .with_context(|| format!("unusable header row in {:?}", path))?;
    Ok((reader, map))
}
