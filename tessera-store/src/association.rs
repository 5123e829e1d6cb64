//! Feature values tagged with outcomes, and persisted comparison results.

use std::collections::BTreeMap;

use rusqlite::params;
use tracing::{debug, info, warn};

use tessera_core::Result;
use tessera_spatial::DerivationMethod;
use tessera_stats::{ComparisonRow, OutcomeValue};

use crate::store::{db_err, Store};
use crate::strata::{StratumKey, TemporalPosition};

/// Outcome of specimens without a stratum.
pub const UNKNOWN_OUTCOME: &str = "unknown";

/// One stored value with its feature's specifiers in ordinal order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeatureValue {
    pub feature: i64,
    pub specifiers: Vec<String>,
    pub specimen: String,
    pub value: f64,
}

impl Store {
    /// Specifier tuples of every feature in a batch, by feature identifier.
    pub fn feature_specifiers(
        &self,
        derivation_method: DerivationMethod,
        analysis_study: &str,
    ) -> Result<BTreeMap<i64, Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT fs.identifier, fsp.specifier FROM feature_specification fs \
                 JOIN feature_specifier fsp ON fsp.feature_specification = fs.identifier \
                 WHERE fs.derivation_method = ?1 AND fs.study = ?2 \
                 ORDER BY fs.identifier, fsp.ordinality",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![derivation_method.as_str(), analysis_study], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        let mut specifiers: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (feature, specifier) = row.map_err(db_err)?;
            specifiers.entry(feature).or_default().push(specifier);
        }
        Ok(specifiers)
    }

    /// Every stored value of a batch. NULL values are skipped.
    pub fn feature_values(
        &self,
        derivation_method: DerivationMethod,
        analysis_study: &str,
    ) -> Result<Vec<StoredFeatureValue>> {
        let specifiers = self.feature_specifiers(derivation_method, analysis_study)?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT qfv.feature, qfv.subject, qfv.value FROM quantitative_feature_value qfv \
                 JOIN feature_specification fs ON fs.identifier = qfv.feature \
                 WHERE fs.derivation_method = ?1 AND fs.study = ?2 \
                 ORDER BY qfv.feature, qfv.subject",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![derivation_method.as_str(), analysis_study], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })
            .map_err(db_err)?;
        let mut values = Vec::new();
        for row in rows {
            let (feature, specimen, value) = row.map_err(db_err)?;
            let Some(value) = value else { continue };
            values.push(StoredFeatureValue {
                feature,
                specifiers: specifiers.get(&feature).cloned().unwrap_or_default(),
                specimen,
                value,
            });
        }
        Ok(values)
    }

    /// Stratum label of every stratified specimen.
    pub fn outcome_labels(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT sample, local_temporal_position_indicator, subject_diagnosed_condition, \
                 subject_diagnosed_result FROM sample_strata",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;
        let mut labels = BTreeMap::new();
        for row in rows {
            let (sample, position, condition, result) = row.map_err(db_err)?;
            let key = StratumKey {
                position: position.parse::<TemporalPosition>().ok(),
                condition: (!condition.is_empty()).then_some(condition),
                result: (!result.is_empty()).then_some(result),
            };
            labels.insert(sample, key.label());
        }
        Ok(labels)
    }

    /// Feature values of a batch with each specimen's stratum label as the
    /// outcome; unstratified specimens get [`UNKNOWN_OUTCOME`].
    pub fn feature_outcome_values(
        &self,
        derivation_method: DerivationMethod,
        analysis_study: &str,
    ) -> Result<Vec<OutcomeValue>> {
        let labels = self.outcome_labels()?;
        let values = self.feature_values(derivation_method, analysis_study)?;
        let mut unknown = 0usize;
        let outcome_values: Vec<OutcomeValue> = values
            .into_iter()
            .map(|v| {
                let outcome = match labels.get(&v.specimen) {
                    Some(label) => label.clone(),
                    None => {
                        unknown += 1;
                        UNKNOWN_OUTCOME.to_string()
                    }
                };
                OutcomeValue {
                    outcome,
                    specimen: v.specimen,
                    specifiers: v.specifiers,
                    value: v.value,
                }
            })
            .collect();
        if unknown > 0 {
            warn!(
                derivation_method = %derivation_method,
                unknown,
                "values from specimens without a stratum"
            );
        }
        debug!(values = outcome_values.len(), "pulled outcome-tagged feature values");
        Ok(outcome_values)
    }

    /// Store comparison rows against the batch's feature identifiers.
    /// Re-recording a (cohorts, test, feature) replaces its p-value.
    pub fn record_association_tests(
        &mut self,
        derivation_method: DerivationMethod,
        analysis_study: &str,
        rows: &[ComparisonRow],
    ) -> Result<usize> {
        let features: BTreeMap<Vec<String>, i64> = self
            .feature_specifiers(derivation_method, analysis_study)?
            .into_iter()
            .map(|(id, specifiers)| (specifiers, id))
            .collect();
        let tx = self.conn.transaction().map_err(db_err)?;
        let mut recorded = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO two_cohort_feature_association_test \
                     (selection_criterion_1, selection_criterion_2, test, p_value, feature_tested) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (selection_criterion_1, selection_criterion_2, test, feature_tested) \
                     DO UPDATE SET p_value = excluded.p_value",
                )
                .map_err(db_err)?;
            for row in rows {
                let Some(feature) = features.get(&row.specifiers) else {
                    warn!(feature = %row.specifiers.join(", "), "no stored feature for comparison row");
                    continue;
                };
                stmt.execute(params![
                    row.outcome_1,
                    row.outcome_2,
                    row.test.to_string(),
                    row.p_value,
                    feature
                ])
                .map_err(db_err)?;
                recorded += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        info!(derivation_method = %derivation_method, recorded, "recorded association tests");
        Ok(recorded)
    }

    pub fn count_association_tests(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM two_cohort_feature_association_test", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }
}
