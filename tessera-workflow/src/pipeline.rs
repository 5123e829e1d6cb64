//! Per-specimen feature computation for one study.
//!
//! Matrices are pulled one specimen at a time over the single store
//! connection, computed in parallel on a rayon pool, and the resulting
//! batches are staged and committed by one uploader transaction.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use tracing::{debug, error, info};

use tessera_core::{Result, TesseraError};
use tessera_spatial::autocorrelation::{self, DEFAULT_AUTOCORRELATION_RADIUS};
use tessera_spatial::front;
use tessera_spatial::proximity::{self, CellAreaSum, ProximityConfig, ProximityRecord};
use tessera_spatial::{
    BruteForceBuilder, DerivationMethod, FeatureBatch, FeatureMatrix, IndexBuilder, KdTreeBuilder,
    PhenotypeSignature,
};
use tessera_store::{CommitOutcome, FeatureUploader, Store};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which spatial index backs radius and nearest-neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    #[default]
    KdTree,
    BruteForce,
}

impl IndexKind {
    pub fn builder(&self) -> Box<dyn IndexBuilder> {
        match self {
            IndexKind::KdTree => Box::new(KdTreeBuilder),
            IndexKind::BruteForce => Box::new(BruteForceBuilder),
        }
    }
}

impl FromStr for IndexKind {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kd-tree" | "kdtree" => Ok(IndexKind::KdTree),
            "brute-force" => Ok(IndexKind::BruteForce),
            other => Err(TesseraError::InvalidInput(format!("unknown index kind '{}'", other))),
        }
    }
}

/// One analysis to run over every specimen of a study.
#[derive(Debug, Clone)]
pub enum Analysis {
    Proximity(ProximityConfig),
    FrontProximity { compartments: Option<Vec<String>> },
    Autocorrelation { radius: f64 },
}

impl Analysis {
    pub fn autocorrelation() -> Self {
        Analysis::Autocorrelation {
            radius: DEFAULT_AUTOCORRELATION_RADIUS,
        }
    }

    pub fn derivation_method(&self) -> DerivationMethod {
        match self {
            Analysis::Proximity(c) if c.balanced => DerivationMethod::BalancedProximity,
            Analysis::Proximity(_) => DerivationMethod::Proximity,
            Analysis::FrontProximity { .. } => DerivationMethod::FrontProximity,
            Analysis::Autocorrelation { .. } => DerivationMethod::SpatialAutocorrelation,
        }
    }
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.derivation_method().as_str())
    }
}

/// Execution parameters shared by all analyses.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    pub index: IndexKind,
    /// Store a zero for every (specimen, feature) the tasks left empty.
    pub impute_zeros: bool,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What one specimen task produced.
#[derive(Debug, Clone)]
pub struct SpecimenResult {
    pub batch: FeatureBatch,
    /// Every proximity record, all compartments included.
    pub proximity: Vec<ProximityRecord>,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub derivation_method: DerivationMethod,
    pub analysis_study: String,
    pub specimens: usize,
    pub skipped: Vec<String>,
    pub outcome: CommitOutcome,
    /// `(specimen, record)` for proximity runs.
    pub proximity: Vec<(String, ProximityRecord)>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pull every specimen's matrix. Specimen-scoped failures are logged and
/// returned by name; anything else aborts.
pub fn load_matrices(store: &Store, study: &str) -> Result<(Vec<FeatureMatrix>, Vec<String>)> {
    let components = store.study_components(study)?;
    let channels = store.channels(&components.measurement)?;
    let mut matrices = Vec::new();
    let mut skipped = Vec::new();
    for specimen in store.specimens(&components.measurement)? {
        match store.feature_matrix(&specimen, &channels, false) {
            Ok(m) => matrices.push(m),
            Err(e) if e.is_specimen_scoped() => {
                error!(specimen = %specimen, "specimen aborted: {}", e);
                skipped.push(specimen);
            }
            Err(e) => return Err(e),
        }
    }
    info!(study, loaded = matrices.len(), skipped = skipped.len(), "pulled feature matrices");
    Ok((matrices, skipped))
}

/// Run one analysis on one specimen.
pub fn compute_specimen(
    matrix: &FeatureMatrix,
    phenotypes: &[PhenotypeSignature],
    analysis: &Analysis,
    builder: &dyn IndexBuilder,
) -> SpecimenResult {
    let specimen = matrix.specimen();
    match analysis {
        Analysis::Proximity(config) => {
            let records = proximity::compute_proximity(matrix, phenotypes, config, builder, &CellAreaSum);
            SpecimenResult {
                batch: proximity::to_feature_batch(specimen, &records, config.balanced),
                proximity: records,
            }
        }
        Analysis::FrontProximity { compartments } => {
            let distances = front::compute_front_distances(matrix, phenotypes, compartments.as_deref(), builder);
            let summaries = front::summarize_front_distances(&distances);
            SpecimenResult {
                batch: front::to_feature_batch(specimen, &summaries),
                proximity: Vec::new(),
            }
        }
        Analysis::Autocorrelation { radius } => {
            let records = autocorrelation::compute_autocorrelation(matrix, *radius, builder);
            SpecimenResult {
                batch: autocorrelation::to_feature_batch(specimen, &records),
                proximity: Vec::new(),
            }
        }
    }
}

fn thread_pool(threads: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| TesseraError::Other(format!("thread pool: {}", e)))
}

/// Compute `analysis` for every specimen of `study` and upload the values
/// to the study's data-analysis component.
pub fn run_analysis(
    store: &mut Store,
    study: &str,
    analysis: &Analysis,
    config: &PipelineConfig,
) -> Result<RunReport> {
    let components = store.study_components(study)?;
    let analysis_study = store.ensure_data_analysis_study(&components)?;
    let channels = store.channels(&components.measurement)?;
    let phenotypes = channels.compile(&store.phenotype_universe(&components.measurement, &channels)?)?;
    let (matrices, skipped) = load_matrices(store, study)?;

    let builder = config.index.builder();
    let pool = thread_pool(config.threads)?;
    info!(
        analysis = %analysis,
        specimens = matrices.len(),
        phenotypes = phenotypes.len(),
        threads = pool.current_num_threads(),
        "computing features"
    );
    let results: Vec<SpecimenResult> = pool.install(|| {
        matrices
            .par_iter()
            .map(|m| compute_specimen(m, &phenotypes, analysis, builder.as_ref()))
            .collect()
    });

    let method = analysis.derivation_method();
    let mut uploader = FeatureUploader::new(method, &analysis_study).with_zero_imputation(config.impute_zeros);
    uploader.expect_specimens(matrices.iter().map(|m| m.specimen().to_string()));
    let mut proximity = Vec::new();
    for result in results {
        debug!(specimen = %result.batch.specimen, values = result.batch.len(), "task finished");
        let specimen = result.batch.specimen.clone();
        uploader.stage_batch(result.batch)?;
        proximity.extend(result.proximity.into_iter().map(|r| (specimen.clone(), r)));
    }
    let outcome = uploader.commit(store)?;
    info!(analysis = %analysis, ?outcome, "upload finished");

    Ok(RunReport {
        derivation_method: method,
        analysis_study,
        specimens: matrices.len(),
        skipped,
        outcome,
        proximity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lymphoma, STUDY};

    #[test]
    fn index_kind_parses() {
        assert_eq!("kd-tree".parse::<IndexKind>().unwrap(), IndexKind::KdTree);
        assert_eq!("brute-force".parse::<IndexKind>().unwrap(), IndexKind::BruteForce);
        assert!("ball-tree".parse::<IndexKind>().is_err());
    }

    #[test]
    fn proximity_run_uploads_once() {
        let mut store = lymphoma();
        let config = PipelineConfig {
            threads: Some(2),
            ..Default::default()
        };
        let analysis = Analysis::Proximity(ProximityConfig {
            radii: vec![5, 20],
            ..Default::default()
        });
        let report = run_analysis(&mut store, STUDY, &analysis, &config).unwrap();
        assert_eq!(report.specimens, 6);
        assert!(report.skipped.is_empty());
        let values = match report.outcome {
            CommitOutcome::Inserted { values, .. } => values,
            other => panic!("unexpected {:?}", other),
        };
        assert!(values > 0);
        assert!(report.proximity.iter().any(|(_, r)| r.compartment != "all"));

        let again = run_analysis(&mut store, STUDY, &analysis, &config).unwrap();
        assert_eq!(again.outcome, CommitOutcome::AlreadyPresent);
        assert_eq!(
            store
                .count_feature_values(DerivationMethod::Proximity, &report.analysis_study)
                .unwrap(),
            values
        );
    }

    #[test]
    fn backends_agree() {
        let store = lymphoma();
        let (matrices, _) = load_matrices(&store, STUDY).unwrap();
        let components = store.study_components(STUDY).unwrap();
        let channels = store.channels(&components.measurement).unwrap();
        let phenotypes = channels
            .compile(&store.phenotype_universe(&components.measurement, &channels).unwrap())
            .unwrap();
        let analysis = Analysis::FrontProximity { compartments: None };
        for m in &matrices {
            let kd = compute_specimen(m, &phenotypes, &analysis, &KdTreeBuilder);
            let brute = compute_specimen(m, &phenotypes, &analysis, &BruteForceBuilder);
            assert_eq!(kd.batch, brute.batch);
        }
    }

    #[test]
    fn front_and_autocorrelation_runs() {
        let mut store = lymphoma();
        let config = PipelineConfig::default();
        let front = run_analysis(&mut store, STUDY, &Analysis::FrontProximity { compartments: None }, &config).unwrap();
        assert!(matches!(front.outcome, CommitOutcome::Inserted { .. }));
        let auto = run_analysis(&mut store, STUDY, &Analysis::autocorrelation(), &config).unwrap();
        assert_eq!(auto.derivation_method, DerivationMethod::SpatialAutocorrelation);
        assert!(matches!(auto.outcome, CommitOutcome::Inserted { .. }));
    }

    #[test]
    fn unmapped_channel_skips_specimen() {
        let mut store = lymphoma();
        crate::testing::add_unmapped_channel_cell(&mut store, 0);
        let report = run_analysis(&mut store, STUDY, &Analysis::autocorrelation(), &PipelineConfig::default()).unwrap();
        assert_eq!(report.specimens, 5);
        assert_eq!(report.skipped, vec![crate::testing::specimen(0)]);
    }
}
