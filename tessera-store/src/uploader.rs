//! Idempotent upload of computed feature values.
//!
//! Values for one (derivation method, data-analysis study) batch are staged
//! in memory and written in a single transaction. The staged set is
//! content-addressed: its sha256 is stored on every feature specification of
//! the batch, and a later commit of the same set is a no-op.
//!
//! ```text
//! staged ──validate──▶ validated ──insert──▶ committed
//!                          │
//!                          └──▶ rejected (InconsistentPriorFeatureValues)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::params;
use tracing::{error, info, warn};

use tessera_core::hash::sha256_lines;
use tessera_core::{ContentAddressable, Result, TesseraError};
use tessera_spatial::{DerivationMethod, FeatureBatch};

use crate::store::{db_err, Store};

/// Where an uploader is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Staged,
    Validated,
    Committed,
    Rejected,
}

/// What a commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was staged.
    Empty,
    /// The batch was already stored.
    AlreadyPresent,
    Inserted { features: usize, values: usize },
}

type ValueKey = (Vec<String>, String);

/// Stages and commits the values of one batch.
#[derive(Debug)]
pub struct FeatureUploader {
    derivation_method: DerivationMethod,
    analysis_study: String,
    impute_zeros: bool,
    expected_specimens: BTreeSet<String>,
    staged: BTreeMap<ValueKey, f64>,
    state: UploadState,
}

impl FeatureUploader {
    pub fn new(derivation_method: DerivationMethod, analysis_study: &str) -> Self {
        Self {
            derivation_method,
            analysis_study: analysis_study.to_string(),
            impute_zeros: false,
            expected_specimens: BTreeSet::new(),
            staged: BTreeMap::new(),
            state: UploadState::Staged,
        }
    }

    /// Fill every (specimen, specifiers) combination absent from the staged
    /// set with 0.
    pub fn with_zero_imputation(mut self, impute_zeros: bool) -> Self {
        self.impute_zeros = impute_zeros;
        self
    }

    /// Specimens that take part in zero imputation even without a staged value.
    pub fn expect_specimens<I, S>(&mut self, specimens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_specimens
            .extend(specimens.into_iter().map(Into::into));
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn derivation_method(&self) -> DerivationMethod {
        self.derivation_method
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn stage(&mut self, specifiers: Vec<String>, specimen: &str, value: f64) -> Result<()> {
        let expected = self.derivation_method.specifier_count();
        if specifiers.len() != expected {
            return Err(TesseraError::InvalidInput(format!(
                "feature specified by {:?}, but '{}' takes {} specifiers",
                specifiers, self.derivation_method, expected
            )));
        }
        if self.state != UploadState::Staged {
            return Err(TesseraError::InvalidInput(format!(
                "cannot stage values in state {:?}",
                self.state
            )));
        }
        let key = (specifiers, specimen.to_string());
        if self.staged.contains_key(&key) {
            return Err(TesseraError::InvalidInput(format!(
                "duplicate value for {:?} in specimen '{}'",
                key.0, key.1
            )));
        }
        self.staged.insert(key, value);
        Ok(())
    }

    pub fn stage_batch(&mut self, batch: FeatureBatch) -> Result<()> {
        if batch.derivation_method != self.derivation_method {
            return Err(TesseraError::InvalidInput(format!(
                "batch of '{}' staged into a '{}' upload",
                batch.derivation_method, self.derivation_method
            )));
        }
        for v in batch.values {
            self.stage(v.specifiers, &v.specimen, v.value)?;
        }
        Ok(())
    }

    /// Staged values plus imputed zeros, in canonical order.
    fn final_values(&self) -> BTreeMap<ValueKey, f64> {
        let mut values = self.staged.clone();
        if self.impute_zeros {
            let specifiers: BTreeSet<&Vec<String>> = self.staged.keys().map(|(s, _)| s).collect();
            let specimens: BTreeSet<&String> = self
                .staged
                .keys()
                .map(|(_, sp)| sp)
                .chain(&self.expected_specimens)
                .collect();
            for s in &specifiers {
                for sp in &specimens {
                    values
                        .entry(((*s).clone(), (*sp).clone()))
                        .or_insert(0.0);
                }
            }
        }
        values
    }

    /// Validate against prior values and insert in one transaction.
    pub fn commit(&mut self, store: &mut Store) -> Result<CommitOutcome> {
        let values = self.final_values();
        if values.is_empty() {
            info!(
                derivation_method = %self.derivation_method,
                "no feature values given to be uploaded"
            );
            self.state = UploadState::Committed;
            return Ok(CommitOutcome::Empty);
        }
        if !store.data_analysis_study_exists(&self.analysis_study)? {
            return Err(TesseraError::Config(format!(
                "data analysis study '{}' does not exist",
                self.analysis_study
            )));
        }
        let hash = canonical_hash(self.derivation_method, &self.analysis_study, &values);
        self.warn_unknown_specimens(store, &values)?;

        let method = self.derivation_method.as_str();
        let tx = store.conn.transaction().map_err(db_err)?;

        let existing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM quantitative_feature_value qfv \
                 JOIN feature_specification fs ON fs.identifier = qfv.feature \
                 WHERE fs.derivation_method = ?1 AND fs.study = ?2",
                params![method, self.analysis_study],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let prior_hashes: Vec<Option<String>> = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT DISTINCT batch_hash FROM feature_specification \
                     WHERE derivation_method = ?1 AND study = ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![method, self.analysis_study], |row| row.get(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };
        self.state = UploadState::Validated;

        if existing > 0 || !prior_hashes.is_empty() {
            let same_hash = prior_hashes.iter().all(|h| h.as_deref() == Some(hash.as_str()));
            let legacy = prior_hashes.iter().all(Option::is_none) && existing as usize == values.len();
            if same_hash || legacy {
                info!(
                    derivation_method = method,
                    study = %self.analysis_study,
                    values = existing,
                    "feature values already present, skipping upload"
                );
                self.state = UploadState::Committed;
                return Ok(CommitOutcome::AlreadyPresent);
            }
            self.state = UploadState::Rejected;
            error!(
                derivation_method = method,
                study = %self.analysis_study,
                existing,
                staged = values.len(),
                "prior feature values differ from the staged batch; purge first"
            );
            return Err(TesseraError::InconsistentPriorFeatureValues {
                derivation_method: method.to_string(),
                study: self.analysis_study.clone(),
                existing: existing as usize,
                staged: values.len(),
            });
        }

        let next_feature: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(identifier), 0) + 1 FROM feature_specification",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let mut next_value: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(identifier), 0) + 1 FROM quantitative_feature_value",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let mut features = 0;
        {
            let mut spec = tx
                .prepare_cached(
                    "INSERT INTO feature_specification (identifier, derivation_method, study, batch_hash) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            let mut specifier = tx
                .prepare_cached(
                    "INSERT INTO feature_specifier (feature_specification, specifier, ordinality) \
                     VALUES (?1, ?2, ?3)",
                )
                .map_err(db_err)?;
            let mut value = tx
                .prepare_cached(
                    "INSERT INTO quantitative_feature_value (identifier, feature, subject, value) \
                     VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;

            let mut current: Option<(&Vec<String>, i64)> = None;
            for ((specifiers, specimen), v) in &values {
                let feature = match current {
                    Some((s, id)) if s == specifiers => id,
                    _ => {
                        let id = next_feature + features as i64;
                        spec.execute(params![id, method, self.analysis_study, hash])
                            .map_err(db_err)?;
                        for (i, s) in specifiers.iter().enumerate() {
                            specifier
                                .execute(params![id, s, (i + 1) as i64])
                                .map_err(db_err)?;
                        }
                        features += 1;
                        current = Some((specifiers, id));
                        id
                    }
                };
                value
                    .execute(params![next_value, feature, specimen, v])
                    .map_err(db_err)?;
                next_value += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        self.state = UploadState::Committed;

        info!(
            derivation_method = method,
            study = %self.analysis_study,
            features,
            values = values.len(),
            "inserted feature values"
        );
        Ok(CommitOutcome::Inserted {
            features,
            values: values.len(),
        })
    }

    fn warn_unknown_specimens(&self, store: &Store, values: &BTreeMap<ValueKey, f64>) -> Result<()> {
        let known: BTreeSet<String> = store.all_specimens()?.into_iter().collect();
        let unknown: BTreeSet<&str> = values
            .keys()
            .map(|(_, sp)| sp.as_str())
            .filter(|sp| !known.contains(*sp))
            .collect();
        if !unknown.is_empty() {
            warn!(
                count = unknown.len(),
                "feature values refer to unknown specimens: {:?}",
                unknown
            );
        }
        Ok(())
    }
}

impl ContentAddressable for FeatureUploader {
    fn content_hash(&self) -> String {
        canonical_hash(self.derivation_method, &self.analysis_study, &self.final_values())
    }
}

/// sha256 over one tab-separated line per value, after a header line naming
/// the batch. `f64` display is the shortest round-trip form.
fn canonical_hash(method: DerivationMethod, study: &str, values: &BTreeMap<ValueKey, f64>) -> String {
    let header = format!("{}\t{}", method, study);
    sha256_lines(std::iter::once(header).chain(values.iter().map(|((specifiers, specimen), v)| {
        format!("{}\t{}\t{}", specifiers.join("\t"), specimen, v)
    })))
}

impl Store {
    /// Delete every feature of one (derivation method, study) batch. Returns
    /// the number of values removed.
    pub fn purge_features(&mut self, derivation_method: DerivationMethod, analysis_study: &str) -> Result<usize> {
        let method = derivation_method.as_str();
        let tx = self.conn.transaction().map_err(db_err)?;
        let selection = "SELECT identifier FROM feature_specification \
                         WHERE derivation_method = ?1 AND study = ?2";
        let values = tx
            .execute(
                &format!("DELETE FROM quantitative_feature_value WHERE feature IN ({})", selection),
                params![method, analysis_study],
            )
            .map_err(db_err)?;
        tx.execute(
            &format!("DELETE FROM feature_specifier WHERE feature_specification IN ({})", selection),
            params![method, analysis_study],
        )
        .map_err(db_err)?;
        tx.execute(
            &format!(
                "DELETE FROM two_cohort_feature_association_test WHERE feature_tested IN ({})",
                selection
            ),
            params![method, analysis_study],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM feature_specification WHERE derivation_method = ?1 AND study = ?2",
            params![method, analysis_study],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        info!(derivation_method = method, study = analysis_study, values, "purged features");
        Ok(values)
    }

    /// Number of stored values for one batch.
    pub fn count_feature_values(&self, derivation_method: DerivationMethod, analysis_study: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM quantitative_feature_value qfv \
                 JOIN feature_specification fs ON fs.identifier = qfv.feature \
                 WHERE fs.derivation_method = ?1 AND fs.study = ?2",
                params![derivation_method.as_str(), analysis_study],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}
