//! Deterministic feature derivation over the aligned grid.
//!
//! Column order is pinned by [`feature_names`]; the trained regressors
//! consume vectors in exactly that order, so the list is the single source
//! of truth for both serialization and inference.

use crate::rolling::{diff, lag, pct_change, rolling_mean, rolling_std, rolling_zscore, wilder_rsi};
use pipeline_core::{AlignedRow, FeatureRow, PipelineError, PipelineResult, ThemeCategory};

pub const PRICE_LAGS: [usize; 7] = [1, 2, 3, 5, 7, 14, 30];
pub const NEWS_LAGS: [usize; 5] = [1, 2, 3, 5, 7];
pub const MA_WINDOWS: [usize; 4] = [5, 10, 20, 30];
pub const RSI_PERIOD: usize = 14;
pub const ZSCORE_WINDOW: usize = 30;
pub const SPIKE_THRESHOLD: f64 = 2.0;
pub const PCT_CHANGE_EPS: f64 = 1e-9;

/// Longest history any derived value reaches back; also the cold-start
/// threshold.
pub const MAX_LOOKBACK: usize = 30;

const INSTRUMENTS: [&str; 2] = ["wti", "brent"];
const NEWS_SERIES: [&str; 3] = ["avg_tone", "tone_std", "event_count"];

/// The canonical ordered feature-name list.
pub fn feature_names() -> Vec<String> {
    let mut names = Vec::new();

    for inst in INSTRUMENTS {
        names.push(format!("{inst}_price"));
        names.push(format!("{inst}_delta"));
        names.push(format!("{inst}_return"));
        for k in PRICE_LAGS {
            names.push(format!("{inst}_price_lag{k}"));
        }
        for k in PRICE_LAGS {
            names.push(format!("{inst}_return_lag{k}"));
        }
        for w in MA_WINDOWS {
            names.push(format!("{inst}_return_ma{w}"));
        }
        for w in MA_WINDOWS {
            names.push(format!("{inst}_return_std{w}"));
        }
        names.push(format!("{inst}_momentum_5_20"));
        names.push(format!("{inst}_momentum_10_30"));
        names.push(format!("{inst}_rsi"));
    }

    names.push("avg_tone".to_string());
    names.push("tone_std".to_string());
    names.push("event_count".to_string());
    names.push("unique_sources".to_string());
    for series in NEWS_SERIES {
        for k in NEWS_LAGS {
            names.push(format!("{series}_lag{k}"));
        }
    }
    for series in NEWS_SERIES {
        names.push(format!("{series}_change"));
        names.push(format!("{series}_pct_change"));
    }
    for category in ThemeCategory::ALL {
        let key = category.key();
        names.push(format!("theme_{key}"));
        names.push(format!("theme_{key}_change"));
        names.push(format!("theme_{key}_pct_change"));
        names.push(format!("theme_{key}_zscore"));
        names.push(format!("theme_{key}_spike"));
    }

    names
}

/// Feature rows plus the count of clamped non-finite values.
#[derive(Debug, Clone)]
pub struct EngineeredFeatures {
    pub rows: Vec<FeatureRow>,
    pub clamped: u64,
}

/// Derive the full feature matrix. Input must be in lexicographic
/// `(country, date)` order — anything else is a pipeline bug, not data.
pub fn engineer(aligned: &[AlignedRow]) -> PipelineResult<EngineeredFeatures> {
    for pair in aligned.windows(2) {
        let a = (&pair[0].country, pair[0].date);
        let b = (&pair[1].country, pair[1].date);
        if a >= b {
            return Err(PipelineError::InternalInvariant(format!(
                "aligned rows out of order at ({}, {})",
                pair[1].country, pair[1].date
            )));
        }
    }

    let names = feature_names();
    let mut rows = Vec::with_capacity(aligned.len());
    let mut clamped = 0u64;

    let mut start = 0;
    while start < aligned.len() {
        let country = &aligned[start].country;
        let mut end = start + 1;
        while end < aligned.len() && &aligned[end].country == country {
            end += 1;
        }
        let group = &aligned[start..end];

        let columns = country_columns(group);
        if columns.len() != names.len() {
            return Err(PipelineError::InternalInvariant(format!(
                "derived {} columns, feature list has {}",
                columns.len(),
                names.len()
            )));
        }

        for (i, row) in group.iter().enumerate() {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                let v = column[i];
                if v.is_nan() {
                    // Insufficient history; zero by policy.
                    values.push(0.0);
                } else if v.is_infinite() {
                    clamped += 1;
                    values.push(0.0);
                } else {
                    values.push(v);
                }
            }
            rows.push(FeatureRow {
                country: row.country.clone(),
                date: row.date,
                values,
            });
        }
        start = end;
    }

    if clamped > 0 {
        tracing::warn!(clamped, "clamped non-finite feature values to zero");
    }

    Ok(EngineeredFeatures { rows, clamped })
}

/// All derived columns for one country group, in canonical order.
fn country_columns(group: &[AlignedRow]) -> Vec<Vec<f64>> {
    let mut cols = Vec::new();

    let wti: Vec<f64> = group.iter().map(|r| r.wti_price).collect();
    let brent: Vec<f64> = group.iter().map(|r| r.brent_price).collect();
    instrument_columns(&wti, &mut cols);
    instrument_columns(&brent, &mut cols);

    let avg_tone: Vec<f64> = group.iter().map(|r| r.avg_tone).collect();
    let tone_std: Vec<f64> = group.iter().map(|r| r.tone_std).collect();
    let event_count: Vec<f64> = group.iter().map(|r| r.event_count as f64).collect();
    let unique_sources: Vec<f64> = group.iter().map(|r| r.unique_sources as f64).collect();

    cols.push(avg_tone.clone());
    cols.push(tone_std.clone());
    cols.push(event_count.clone());
    cols.push(unique_sources);

    let news = [&avg_tone, &tone_std, &event_count];
    for series in news {
        for k in NEWS_LAGS {
            cols.push(lag(series, k));
        }
    }
    for series in news {
        cols.push(diff(series));
        cols.push(pct_change(series, PCT_CHANGE_EPS));
    }

    for category in ThemeCategory::ALL {
        let counts: Vec<f64> = group
            .iter()
            .map(|r| r.theme_counts[category.index()] as f64)
            .collect();
        let zscore = rolling_zscore(&counts, ZSCORE_WINDOW);
        let spike: Vec<f64> = zscore
            .iter()
            .map(|&z| if z > SPIKE_THRESHOLD { 1.0 } else { 0.0 })
            .collect();

        cols.push(counts.clone());
        cols.push(diff(&counts));
        cols.push(pct_change(&counts, PCT_CHANGE_EPS));
        cols.push(zscore);
        cols.push(spike);
    }

    cols
}

/// Price, delta, return, lags, rolling stats, momentum and RSI for one
/// instrument.
fn instrument_columns(price: &[f64], cols: &mut Vec<Vec<f64>>) {
    let delta = diff(price);
    let ret: Vec<f64> = (0..price.len())
        .map(|i| {
            if i >= 1 {
                (price[i] - price[i - 1]) / price[i - 1]
            } else {
                f64::NAN
            }
        })
        .collect();

    cols.push(price.to_vec());
    cols.push(delta);
    cols.push(ret.clone());

    for k in PRICE_LAGS {
        cols.push(lag(price, k));
    }
    for k in PRICE_LAGS {
        cols.push(lag(&ret, k));
    }

    let mas: Vec<Vec<f64>> = MA_WINDOWS.iter().map(|&w| rolling_mean(&ret, w)).collect();
    for ma in &mas {
        cols.push(ma.clone());
    }
    for w in MA_WINDOWS {
        cols.push(rolling_std(&ret, w));
    }

    // Momentum over the return moving averages (5-20 and 10-30).
    cols.push(zip_sub(&mas[0], &mas[2]));
    cols.push(zip_sub(&mas[1], &mas[3]));

    cols.push(wilder_rsi(price, RSI_PERIOD));
}

fn zip_sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}
