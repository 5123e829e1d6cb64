//! Outcome-stratified comparison of stored feature values.

use std::path::Path;

use tracing::info;

use tessera_core::{Result, TesseraError};
use tessera_spatial::DerivationMethod;
use tessera_stats::correction::{correct, CorrectionMethod};
use tessera_stats::{compare_outcomes, ComparisonConfig, ComparisonRow};
use tessera_store::Store;

/// Comparison parameters beyond the per-pair test settings.
#[derive(Debug, Clone, Default)]
pub struct CohortOptions {
    pub comparison: ComparisonConfig,
    pub correction: Option<CorrectionMethod>,
    /// Write the rows to `two_cohort_feature_association_test`.
    pub persist: bool,
}

/// A comparison row with its adjusted p-value, when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortComparison {
    pub row: ComparisonRow,
    pub adjusted_p_value: Option<f64>,
}

/// Compare the strata of `study` over one derivation method's values.
pub fn compare_cohorts(
    store: &mut Store,
    study: &str,
    derivation_method: DerivationMethod,
    options: &CohortOptions,
) -> Result<Vec<CohortComparison>> {
    let components = store.study_components(study)?;
    let analysis_study = components.analysis_study_name();
    let values = store.feature_outcome_values(derivation_method, &analysis_study)?;
    let rows = compare_outcomes(&values, &options.comparison);

    let adjusted = match options.correction {
        Some(method) if !rows.is_empty() => {
            let p: Vec<f64> = rows.iter().map(|r| r.p_value).collect();
            correct(&p, method)?.into_iter().map(Some).collect()
        }
        _ => vec![None; rows.len()],
    };
    if options.persist {
        store.record_association_tests(derivation_method, &analysis_study, &rows)?;
    }
    info!(
        study,
        derivation_method = %derivation_method,
        values = values.len(),
        rows = rows.len(),
        significant = rows.iter().filter(|r| r.significant).count(),
        "compared cohorts"
    );
    Ok(rows
        .into_iter()
        .zip(adjusted)
        .map(|(row, adjusted_p_value)| CohortComparison { row, adjusted_p_value })
        .collect())
}

const HEADER: [&str; 11] = [
    "outcome 1",
    "outcome 2",
    "feature",
    "tested value 1",
    "tested value 2",
    "test",
    "p-value",
    "adjusted p-value",
    "absolute effect",
    "effect sign",
    "p < threshold",
];

/// Write comparison rows as tab-separated text to `out`.
pub fn write_comparisons<W: std::io::Write>(out: W, comparisons: &[CohortComparison]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    let csv_err = |e: csv::Error| TesseraError::Other(e.to_string());
    writer.write_record(HEADER).map_err(csv_err)?;
    for c in comparisons {
        let r = &c.row;
        writer
            .write_record([
                r.outcome_1.clone(),
                r.outcome_2.clone(),
                r.specifiers.join(", "),
                r.tested_value_1.to_string(),
                r.tested_value_2.to_string(),
                r.test.to_string(),
                r.p_value.to_string(),
                c.adjusted_p_value.map(|p| p.to_string()).unwrap_or_default(),
                r.absolute_effect.to_string(),
                r.effect_sign.to_string(),
                r.significant.to_string(),
            ])
            .map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

/// Same as [`write_comparisons`], into a file.
pub fn write_comparisons_file(path: impl AsRef<Path>, comparisons: &[CohortComparison]) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    write_comparisons(file, comparisons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lymphoma, specimen, STUDY};
    use tessera_stats::TestKind;
    use tessera_store::FeatureUploader;

    const TOL: f64 = 1e-12;

    fn stage_values(store: &mut Store) {
        let components = store.study_components(STUDY).unwrap();
        let study = store.ensure_data_analysis_study(&components).unwrap();
        let mut uploader = FeatureUploader::new(DerivationMethod::SpatialAutocorrelation, &study);
        let data = [0.10, 0.12, 0.15, 0.40, 0.45, 0.43];
        for (j, v) in data.iter().enumerate() {
            uploader.stage(vec!["CD68".into()], &specimen(j), *v).unwrap();
            uploader.stage(vec!["CD3".into()], &specimen(j), 0.2).unwrap();
        }
        uploader.commit(store).unwrap();
        store.create_strata().unwrap();
    }

    #[test]
    fn compares_strata_and_adjusts() {
        let mut store = lymphoma();
        stage_values(&mut store);
        let options = CohortOptions {
            correction: Some(CorrectionMethod::Bonferroni),
            persist: true,
            ..Default::default()
        };
        let result = compare_cohorts(&mut store, STUDY, DerivationMethod::SpatialAutocorrelation, &options).unwrap();
        // CD3 is constant in both strata and is skipped.
        assert_eq!(result.len(), 2);
        for c in &result {
            assert_eq!(c.row.specifiers, vec!["CD68".to_string()]);
            assert_eq!(c.row.outcome_1, "Between interventions; Relapse; relapsed");
            assert_eq!(c.row.outcome_2, "Between interventions; Relapse; remission");
            assert_eq!(c.row.effect_sign, 1);
            let adjusted = c.adjusted_p_value.unwrap();
            assert!((adjusted - (c.row.p_value * 2.0).min(1.0)).abs() < TOL);
        }
        let t = result.iter().find(|c| c.row.test == TestKind::TTest).unwrap();
        assert!((t.row.tested_value_1 - 0.37 / 3.0).abs() < TOL);
        assert_eq!(store.count_association_tests().unwrap(), 2);
    }

    #[test]
    fn without_strata_everything_is_unknown() {
        let mut store = lymphoma();
        let components = store.study_components(STUDY).unwrap();
        let study = store.ensure_data_analysis_study(&components).unwrap();
        let mut uploader = FeatureUploader::new(DerivationMethod::FrontProximity, &study);
        for j in 0..6 {
            uploader
                .stage(vec!["CD3".into(), "Tumor".into(), "Stroma".into()], &specimen(j), j as f64)
                .unwrap();
        }
        uploader.commit(&mut store).unwrap();
        let result = compare_cohorts(&mut store, STUDY, DerivationMethod::FrontProximity, &CohortOptions::default())
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn writes_tsv() {
        let mut store = lymphoma();
        stage_values(&mut store);
        let result = compare_cohorts(
            &mut store,
            STUDY,
            DerivationMethod::SpatialAutocorrelation,
            &CohortOptions::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        write_comparisons(&mut out, &result).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("outcome 1\toutcome 2\tfeature"));
        assert_eq!(lines[1].split('\t').nth(7), Some(""));
    }
}
