//! Country×day aggregation of event records.
//!
//! Each event contributes once per country in its country set intersected
//! with the universe. Records naming no universe country fall out here.

pub mod themes;

use chrono::NaiveDate;
use pipeline_core::{AggregatedEvent, CountryCode, EventRecord, THEME_COUNT};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct CountryAccumulator {
    tones: Vec<f64>,
    sources: BTreeSet<String>,
    theme_counts: [u32; THEME_COUNT],
}

/// Aggregate one day of events over the universe, keyed by `(country, date)`.
/// Output is ordered by country.
pub fn aggregate(
    events: &[EventRecord],
    date: NaiveDate,
    universe: &BTreeSet<CountryCode>,
) -> Vec<AggregatedEvent> {
    let mut by_country: BTreeMap<CountryCode, CountryAccumulator> = BTreeMap::new();

    for event in events {
        let hits = themes::categorize(&event.themes);
        for country in &event.countries {
            if !universe.contains(country) {
                continue;
            }
            let acc = by_country.entry(country.clone()).or_default();
            acc.tones.push(event.tone);
            acc.sources.insert(event.source_id.clone());
            for (count, hit) in acc.theme_counts.iter_mut().zip(hits) {
                if hit {
                    *count += 1;
                }
            }
        }
    }

    by_country
        .into_iter()
        .map(|(country, acc)| {
            let tones: &[f64] = &acc.tones;
            let n = tones.len();
            let avg_tone = if n == 0 { 0.0 } else { tones.mean() };
            // Sample standard deviation; zero by definition when n <= 1.
            let tone_std = if n <= 1 { 0.0 } else { tones.std_dev() };
            AggregatedEvent {
                country,
                date,
                event_count: n as u32,
                avg_tone,
                tone_std,
                unique_sources: acc.sources.len() as u32,
                theme_counts: acc.theme_counts,
            }
        })
        .collect()
}
