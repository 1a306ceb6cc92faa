//! Canonical country×day grid construction.
//!
//! Event aggregates are zero-filled on silent days; prices are
//! forward-filled across non-trading days. Output order is lexicographic
//! `(country, date)` — the feature engineer computes lags from it.

use chrono::{Days, NaiveDate};
use pipeline_core::{AggregatedEvent, AlignedRow, CountryCode, PricePoint, THEME_COUNT};
use std::collections::{BTreeMap, BTreeSet};

/// Merge aggregates and prices over the grid U × D, where D is the
/// contiguous calendar window of `lookback_days` days ending at
/// `target_date`. Days with no preceding trading day inside the window are
/// dropped from the whole grid.
pub fn align(
    aggregated: &[AggregatedEvent],
    prices: &[PricePoint],
    universe: &BTreeSet<CountryCode>,
    target_date: NaiveDate,
    lookback_days: u32,
) -> Vec<AlignedRow> {
    let start = target_date
        .checked_sub_days(Days::new(lookback_days.saturating_sub(1) as u64))
        .unwrap_or(target_date);

    let price_by_date: BTreeMap<NaiveDate, (f64, f64)> = prices
        .iter()
        .filter(|p| p.date >= start && p.date <= target_date)
        .map(|p| (p.date, (p.wti_close, p.brent_close)))
        .collect();

    // Forward-fill pass over the calendar window. Leading days with no
    // prior trading day are dropped entirely.
    let mut days: Vec<(NaiveDate, f64, f64, bool)> = Vec::new();
    let mut carried: Option<(f64, f64)> = None;
    let mut day = start;
    while day <= target_date {
        match price_by_date.get(&day) {
            Some(&(wti, brent)) => {
                carried = Some((wti, brent));
                days.push((day, wti, brent, false));
            }
            None => {
                if let Some((wti, brent)) = carried {
                    days.push((day, wti, brent, true));
                }
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    let events: BTreeMap<(&CountryCode, NaiveDate), &AggregatedEvent> = aggregated
        .iter()
        .map(|agg| ((&agg.country, agg.date), agg))
        .collect();

    let mut rows = Vec::with_capacity(universe.len() * days.len());
    for country in universe {
        for &(date, wti_price, brent_price, price_filled) in &days {
            let row = match events.get(&(country, date)) {
                Some(agg) => AlignedRow {
                    country: country.clone(),
                    date,
                    event_count: agg.event_count,
                    avg_tone: agg.avg_tone,
                    tone_std: agg.tone_std,
                    unique_sources: agg.unique_sources,
                    theme_counts: agg.theme_counts,
                    wti_price,
                    brent_price,
                    price_filled,
                },
                // A silent day is a zero day, not a stale one.
                None => AlignedRow {
                    country: country.clone(),
                    date,
                    event_count: 0,
                    avg_tone: 0.0,
                    tone_std: 0.0,
                    unique_sources: 0,
                    theme_counts: [0; THEME_COUNT],
                    wti_price,
                    brent_price,
                    price_filled,
                },
            };
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn universe(codes: &[&str]) -> BTreeSet<CountryCode> {
        codes.iter().map(|c| CountryCode::parse(c).unwrap()).collect()
    }

    fn price(s: &str, wti: f64, brent: f64) -> PricePoint {
        PricePoint {
            date: date(s),
            wti_close: wti,
            brent_close: brent,
        }
    }

    #[test]
    fn empty_news_day_is_zero_filled() {
        // Scenario: no events at all; Friday and Monday prices.
        let prices = vec![price("2025-03-07", 79.50, 82.0), price("2025-03-10", 80.00, 82.9)];
        let rows = align(&[], &prices, &universe(&["USA"]), date("2025-03-10"), 4);

        let monday = rows.iter().find(|r| r.date == date("2025-03-10")).unwrap();
        assert_eq!(monday.event_count, 0);
        assert_eq!(monday.avg_tone, 0.0);
        assert_eq!(monday.tone_std, 0.0);
        assert!((monday.wti_price - 80.00).abs() < 1e-12);
        assert!(!monday.price_filled);
    }

    #[test]
    fn weekend_rows_carry_prior_close() {
        let prices = vec![price("2025-03-07", 79.50, 82.0), price("2025-03-10", 80.00, 82.9)];
        let rows = align(&[], &prices, &universe(&["USA"]), date("2025-03-10"), 4);

        assert_eq!(rows.len(), 4);
        let saturday = rows.iter().find(|r| r.date == date("2025-03-08")).unwrap();
        assert!((saturday.wti_price - 79.50).abs() < 1e-12);
        assert!(saturday.price_filled);

        let sunday = rows.iter().find(|r| r.date == date("2025-03-09")).unwrap();
        assert!((sunday.wti_price - 79.50).abs() < 1e-12);
    }

    #[test]
    fn days_before_first_price_are_dropped_grid_wide() {
        let prices = vec![price("2025-03-07", 79.50, 82.0)];
        let rows = align(
            &[],
            &prices,
            &universe(&["USA", "SAU"]),
            date("2025-03-08"),
            5,
        );

        // 03-04..03-06 have no prior close inside the window.
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.date >= date("2025-03-07")));
    }

    #[test]
    fn output_is_lexicographic_by_country_then_date() {
        let prices = vec![price("2025-03-07", 79.50, 82.0), price("2025-03-10", 80.00, 82.9)];
        let rows = align(
            &[],
            &prices,
            &universe(&["USA", "SAU"]),
            date("2025-03-10"),
            4,
        );

        let keys: Vec<(String, NaiveDate)> = rows
            .iter()
            .map(|r| (r.country.as_str().to_string(), r.date))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0].0, "SAU");
    }

    #[test]
    fn aggregates_attach_to_their_cell() {
        let aggregated = vec![AggregatedEvent {
            country: CountryCode::parse("USA").unwrap(),
            date: date("2025-03-10"),
            event_count: 3,
            avg_tone: -1.5,
            tone_std: 0.4,
            unique_sources: 2,
            theme_counts: [1, 0, 0, 0, 2, 0],
        }];
        let prices = vec![price("2025-03-10", 80.0, 82.9)];
        let rows = align(
            &aggregated,
            &prices,
            &universe(&["USA"]),
            date("2025-03-10"),
            1,
        );

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_count, 3);
        assert!((rows[0].avg_tone - (-1.5)).abs() < 1e-12);
        assert_eq!(rows[0].theme_counts[4], 2);
    }
}
