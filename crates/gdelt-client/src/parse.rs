//! Tab-delimited GKG row parsing.
//!
//! Relevant positional columns: 1 = timestamp (`YYYYMMDDhhmmss`),
//! 3 = source id, 7 = themes (`;`-separated), 9 = locations (`;`-separated
//! `type#name#code2#code3#...` entries), 15 = tone (`,`-separated, first
//! component is the score).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pipeline_core::{CountryCode, EventRecord, FetchStats, PipelineError, PipelineResult};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const COL_TIMESTAMP: usize = 1;
const COL_SOURCE: usize = 3;
const COL_THEMES: usize = 7;
const COL_LOCATIONS: usize = 9;
const COL_TONE: usize = 15;
const MIN_COLUMNS: usize = 16;

/// Unzip one bundle and parse its rows. Rows that fail to parse or fall
/// outside `date` are dropped with a counter, never surfaced.
pub fn parse_bundle(bytes: &[u8], date: NaiveDate) -> PipelineResult<(Vec<EventRecord>, FetchStats)> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::Parse(format!("bad zip container: {e}")))?;
    if archive.len() == 0 {
        return Err(PipelineError::Parse("empty zip container".to_string()));
    }

    let mut csv = String::new();
    archive
        .by_index(0)
        .map_err(|e| PipelineError::Parse(format!("bad zip entry: {e}")))?
        .read_to_string(&mut csv)
        .map_err(|e| PipelineError::Parse(format!("bundle is not UTF-8: {e}")))?;

    let mut records = Vec::new();
    let mut stats = FetchStats::default();
    for line in csv.lines() {
        if line.is_empty() {
            continue;
        }
        match parse_row(line, date) {
            Some(record) => {
                stats.rows_parsed += 1;
                records.push(record);
            }
            None => stats.rows_dropped += 1,
        }
    }

    Ok((records, stats))
}

/// Parse one tab-delimited row. `None` drops the row silently (counted by
/// the caller).
pub fn parse_row(line: &str, date: NaiveDate) -> Option<EventRecord> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < MIN_COLUMNS {
        return None;
    }

    let timestamp = parse_timestamp(cols[COL_TIMESTAMP])?;
    if timestamp.date_naive() != date {
        return None;
    }

    let source_id = cols[COL_SOURCE].trim();
    if source_id.is_empty() {
        return None;
    }

    let countries = parse_locations(cols[COL_LOCATIONS]);
    if countries.is_empty() {
        return None;
    }

    let tone = parse_tone(cols[COL_TONE])?;

    Some(EventRecord {
        timestamp,
        source_id: source_id.to_string(),
        countries,
        tone,
        themes: parse_themes(cols[COL_THEMES]),
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Location entries are `type#name#code2#code3#...`; the 3-letter code is
/// retained when non-empty.
pub fn parse_locations(field: &str) -> BTreeSet<CountryCode> {
    field
        .split(';')
        .filter_map(|entry| {
            let mut parts = entry.split('#');
            parts.next()?; // type
            parts.next()?; // name
            parts.next()?; // 2-letter code
            CountryCode::parse(parts.next()?)
        })
        .collect()
}

/// Deduplicated, prefix-trimmed theme tokens.
pub fn parse_themes(field: &str) -> BTreeSet<String> {
    field
        .split(';')
        .map(|token| token.trim().trim_matches(',').to_ascii_uppercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// The tone field carries several comma-separated statistics; the score is
/// the first.
pub fn parse_tone(field: &str) -> Option<f64> {
    field.split(',').next()?.trim().parse().ok()
}
