//! Two-stage inference: per-country regression, then temperature-scaled
//! attention over graph salience.

use crate::bundle::ModelBundle;
use nalgebra::DVector;
use pipeline_core::{
    CountryAttribution, CountryCode, PipelineError, PipelineResult, PredictionReport,
    ProcessedDataset,
};
use std::collections::BTreeMap;

/// Rows of history under which a country is flagged cold-started.
const COLD_START_MIN_ROWS: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct InferenceOptions {
    /// Used when the bundle metadata does not pin a temperature.
    pub fallback_temperature: f64,
    /// Attribution truncation for `top_contributors`.
    pub top_countries: usize,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            fallback_temperature: 0.25,
            top_countries: 15,
        }
    }
}

/// Predict the next trading day's WTI delta for the latest date in
/// `dataset`, with per-country attribution.
pub fn predict(
    dataset: &ProcessedDataset,
    bundle: &ModelBundle,
    opts: &InferenceOptions,
) -> PipelineResult<PredictionReport> {
    let metadata = &bundle.metadata;
    if dataset.feature_names != metadata.feature_names {
        return Err(PipelineError::SchemaMismatch(format!(
            "dataset has {} features, model '{}' expects {}",
            dataset.feature_names.len(),
            metadata.model_version,
            metadata.feature_names.len()
        )));
    }

    let temperature = metadata
        .temperature
        .unwrap_or(opts.fallback_temperature);
    if !(temperature > 0.0) {
        return Err(PipelineError::InternalInvariant(format!(
            "non-positive attention temperature {temperature}"
        )));
    }

    // Latest feature row per country.
    let mut last_rows: BTreeMap<&CountryCode, &pipeline_core::FeatureRow> = BTreeMap::new();
    for row in &dataset.rows {
        match last_rows.get(&row.country) {
            Some(existing) if existing.date >= row.date => {}
            _ => {
                last_rows.insert(&row.country, row);
            }
        }
    }

    // Countries in canonical universe order; those without data or without
    // a regressor are noted and skipped.
    let mut eligible: Vec<(usize, &CountryCode)> = Vec::new();
    let mut skipped = Vec::new();
    for (index, country) in metadata.countries.iter().enumerate() {
        if last_rows.contains_key(country) && bundle.regressors.contains_key(country) {
            eligible.push((index, country));
        } else {
            skipped.push(country.clone());
        }
    }
    if eligible.is_empty() {
        return Err(PipelineError::UpstreamUnavailable(
            "no country has both a feature row and a regressor".to_string(),
        ));
    }

    // Stage one: scaled features through each country's regressor.
    let mut raw_deltas = Vec::with_capacity(eligible.len());
    for (_, country) in &eligible {
        let row = last_rows[*country];
        let scaled = bundle.scaler.transform(&row.values);
        let delta = bundle.regressors[*country].predict(&scaled);
        raw_deltas.push(delta);
    }

    // Stage two: salience is graph centrality weighted by signal magnitude.
    let scores = DVector::from_iterator(
        eligible.len(),
        eligible
            .iter()
            .zip(&raw_deltas)
            .map(|((index, _), delta)| bundle.adjacency_row_sum(*index) * delta.abs()),
    );
    let attention = softmax_with_temperature(&scores, temperature)?;

    let mut per_country = BTreeMap::new();
    let mut predicted_delta = 0.0;
    let mut total_abs_contribution = 0.0;
    for (slot, (_, country)) in eligible.iter().enumerate() {
        let contribution = raw_deltas[slot] * attention[slot];
        predicted_delta += contribution;
        total_abs_contribution += contribution.abs();
        per_country.insert(
            (*country).clone(),
            CountryAttribution {
                raw_delta: raw_deltas[slot],
                attention_weight: attention[slot],
                contribution,
                percentage: 0.0,
            },
        );
    }
    for attribution in per_country.values_mut() {
        attribution.percentage = if total_abs_contribution == 0.0 {
            0.0
        } else {
            attribution.contribution.abs() / total_abs_contribution * 100.0
        };
    }

    if !predicted_delta.is_finite() {
        return Err(PipelineError::InternalInvariant(format!(
            "predicted delta is {predicted_delta}"
        )));
    }

    let target_date = dataset.last_date().ok_or_else(|| {
        PipelineError::UpstreamUnavailable("dataset has no rows".to_string())
    })?;
    let reference_close = reference_close(dataset, target_date)?;

    let mut top_contributors: Vec<CountryCode> = per_country.keys().cloned().collect();
    top_contributors.sort_by(|a, b| {
        let ca = per_country[a].contribution.abs();
        let cb = per_country[b].contribution.abs();
        cb.partial_cmp(&ca).unwrap_or(std::cmp::Ordering::Equal)
    });
    top_contributors.truncate(opts.top_countries);

    Ok(PredictionReport {
        target_date,
        reference_close,
        predicted_delta,
        predicted_close: reference_close + predicted_delta,
        per_country,
        top_contributors,
        total_abs_contribution,
        model_version: metadata.model_version.clone(),
        skipped_countries: skipped,
        cold_start_countries: dataset.cold_start_countries(COLD_START_MIN_ROWS),
    })
}

/// Numerically stable softmax: the max score is subtracted before
/// exponentiation. Scaling scores and temperature together leaves the
/// output unchanged.
fn softmax_with_temperature(scores: &DVector<f64>, temperature: f64) -> PipelineResult<DVector<f64>> {
    let max_score = scores.max();
    let exps = scores.map(|s| ((s - max_score) / temperature).exp());
    let sum = exps.sum();
    let attention = exps / sum;

    if attention.iter().any(|w| !w.is_finite()) {
        return Err(PipelineError::InternalInvariant(
            "non-finite attention weight".to_string(),
        ));
    }
    Ok(attention)
}

/// The last WTI close in the dataset anchors the predicted close.
fn reference_close(dataset: &ProcessedDataset, target_date: chrono::NaiveDate) -> PipelineResult<f64> {
    let wti_index = dataset
        .feature_names
        .iter()
        .position(|n| n == "wti_price")
        .ok_or_else(|| {
            PipelineError::InternalInvariant("dataset has no wti_price column".to_string())
        })?;
    dataset
        .rows
        .iter()
        .find(|r| r.date == target_date)
        .map(|r| r.values[wti_index])
        .ok_or_else(|| {
            PipelineError::InternalInvariant("no row at the dataset's own last date".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{FeatureScaler, ModelMetadata};
    use crate::regressor::{LinearModel, Regressor};
    use chrono::NaiveDate;
    use nalgebra::DMatrix;
    use pipeline_core::FeatureRow;
    use std::collections::HashMap;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn cc(code: &str) -> CountryCode {
        CountryCode::parse(code).unwrap()
    }

    fn names() -> Vec<String> {
        vec!["wti_price".to_string(), "avg_tone".to_string()]
    }

    fn constant_regressor(value: f64) -> Regressor {
        Regressor::Linear(LinearModel {
            intercept: value,
            coefficients: vec![0.0, 0.0],
        })
    }

    /// Bundle over {SAU, USA} with constant per-country deltas and an
    /// all-ones adjacency (equal row sums).
    fn bundle(deltas: [f64; 2], adjacency_scale: f64, temperature: f64) -> ModelBundle {
        let countries = vec![cc("SAU"), cc("USA")];
        let mut regressors = HashMap::new();
        regressors.insert(cc("SAU"), constant_regressor(deltas[0]));
        regressors.insert(cc("USA"), constant_regressor(deltas[1]));

        ModelBundle {
            regressors,
            scaler: FeatureScaler {
                mean: vec![0.0, 0.0],
                scale: vec![1.0, 1.0],
            },
            adjacency: DMatrix::from_element(2, 2, adjacency_scale),
            metadata: ModelMetadata {
                feature_names: names(),
                model_version: "2025.03-test".to_string(),
                temperature: Some(temperature),
                countries,
                schema_version: 1,
            },
        }
    }

    fn dataset() -> ProcessedDataset {
        let rows = vec![
            FeatureRow {
                country: cc("SAU"),
                date: date("2025-03-10"),
                values: vec![80.0, -1.0],
            },
            FeatureRow {
                country: cc("USA"),
                date: date("2025-03-10"),
                values: vec![80.0, 0.5],
            },
        ];
        ProcessedDataset::new(date("2025-03-10"), names(), rows).unwrap()
    }

    #[test]
    fn degenerate_signal_splits_attention_evenly() {
        // Scenario: equal adjacency row sums, raw deltas +0.5 and -0.5.
        let bundle = bundle([0.5, -0.5], 1.0, 0.25);
        let report = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();

        let sau = &report.per_country[&cc("SAU")];
        let usa = &report.per_country[&cc("USA")];
        assert!((sau.attention_weight - 0.5).abs() < 1e-9);
        assert!((usa.attention_weight - 0.5).abs() < 1e-9);
        assert!(report.predicted_delta.abs() < 1e-9);
        assert!((report.total_abs_contribution - 0.5).abs() < 1e-9);
        assert!((sau.percentage - 50.0).abs() < 1e-9);
        assert!((usa.percentage - 50.0).abs() < 1e-9);
        assert!((report.predicted_close - 80.0).abs() < 1e-9);
    }

    #[test]
    fn schema_mismatch_refuses_inference() {
        let mut bundle = bundle([0.5, -0.5], 1.0, 0.25);
        bundle
            .metadata
            .feature_names
            .push("phantom_column".to_string());
        bundle.scaler.mean.push(0.0);
        bundle.scaler.scale.push(1.0);

        let err = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
        assert!(!err.is_soft());
    }

    #[test]
    fn attention_sums_to_one_and_delta_matches_contributions() {
        let bundle = bundle([0.8, -0.1], 1.0, 0.25);
        let report = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();

        let weight_sum: f64 = report
            .per_country
            .values()
            .map(|a| a.attention_weight)
            .sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);

        let contribution_sum: f64 = report.per_country.values().map(|a| a.contribution).sum();
        assert!((report.predicted_delta - contribution_sum).abs() < 1e-9);

        // The larger |raw delta| carries the larger attention.
        assert!(
            report.per_country[&cc("SAU")].attention_weight
                > report.per_country[&cc("USA")].attention_weight
        );
        assert_eq!(report.top_contributors[0], cc("SAU"));
    }

    #[test]
    fn attention_scaling_law() {
        // Scores scaled by 3 and temperature scaled by 3 give the same
        // attention.
        let base = predict(
            &dataset(),
            &bundle([0.8, -0.1], 1.0, 0.25),
            &InferenceOptions::default(),
        )
        .unwrap();
        let scaled = predict(
            &dataset(),
            &bundle([0.8, -0.1], 3.0, 0.75),
            &InferenceOptions::default(),
        )
        .unwrap();

        for country in [cc("SAU"), cc("USA")] {
            assert!(
                (base.per_country[&country].attention_weight
                    - scaled.per_country[&country].attention_weight)
                    .abs()
                    < 1e-9
            );
        }
    }

    #[test]
    fn inference_is_deterministic() {
        let bundle = bundle([0.8, -0.1], 1.0, 0.25);
        let first = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();
        let second = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();

        assert_eq!(first.predicted_delta, second.predicted_delta);
        assert_eq!(first.total_abs_contribution, second.total_abs_contribution);
        for (country, attribution) in &first.per_country {
            let other = &second.per_country[country];
            assert_eq!(attribution.attention_weight, other.attention_weight);
            assert_eq!(attribution.contribution, other.contribution);
        }
    }

    #[test]
    fn zero_deltas_report_zero_percentages() {
        let bundle = bundle([0.0, 0.0], 1.0, 0.25);
        let report = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();

        assert_eq!(report.total_abs_contribution, 0.0);
        for attribution in report.per_country.values() {
            assert_eq!(attribution.percentage, 0.0);
            assert!((attribution.attention_weight - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn countries_without_rows_are_skipped_not_fatal() {
        let bundle = bundle([0.5, -0.5], 1.0, 0.25);
        let rows = vec![FeatureRow {
            country: cc("SAU"),
            date: date("2025-03-10"),
            values: vec![80.0, -1.0],
        }];
        let dataset = ProcessedDataset::new(date("2025-03-10"), names(), rows).unwrap();

        let report = predict(&dataset, &bundle, &InferenceOptions::default()).unwrap();
        assert_eq!(report.skipped_countries, vec![cc("USA")]);
        assert!((report.per_country[&cc("SAU")].attention_weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_overlap_is_upstream_unavailable() {
        let bundle = bundle([0.5, -0.5], 1.0, 0.25);
        let rows = vec![FeatureRow {
            country: cc("RUS"),
            date: date("2025-03-10"),
            values: vec![80.0, 0.0],
        }];
        let dataset = ProcessedDataset::new(date("2025-03-10"), names(), rows).unwrap();

        assert!(matches!(
            predict(&dataset, &bundle, &InferenceOptions::default()),
            Err(PipelineError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn short_history_raises_cold_start_flag() {
        let bundle = bundle([0.5, -0.5], 1.0, 0.25);
        let report = predict(&dataset(), &bundle, &InferenceOptions::default()).unwrap();
        // One row per country is far under the 30-row window.
        assert_eq!(report.cold_start_countries, vec![cc("SAU"), cc("USA")]);
    }
}
