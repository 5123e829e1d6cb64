//! Per-specimen feature matrices written as TSV, with a JSON index.
//!
//! Files are named `<k>.<j>.tsv` for study `k` and specimen `j`, both
//! counted from zero in sorted order. `features.json` maps each study's
//! specimens to their files and carries channel columns and strata.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info};

use tessera_core::{Result, TesseraError};
use tessera_spatial::{EncodingMode, MatrixTable};

use crate::store::Store;
use crate::strata::Stratum;

pub const INDEX_FILE_NAME: &str = "features.json";

/// What to export and how.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub mode: EncodingMode,
    pub include_intensities: bool,
    /// Add one 0/1 column per named composite phenotype of the study.
    pub include_phenotypes: bool,
    /// Restrict to one study; all studies otherwise.
    pub study: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            mode: EncodingMode::Expanded,
            include_intensities: false,
            include_phenotypes: true,
            study: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct MatrixEntry {
    filename: String,
    cells: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SampleCohorts {
    assignments: BTreeMap<String, i64>,
    strata: Vec<Stratum>,
}

#[derive(Debug, Clone, Serialize)]
struct StudyIndex {
    #[serde(rename = "feature matrices")]
    feature_matrices: BTreeMap<String, MatrixEntry>,
    #[serde(rename = "channel symbols by column name")]
    channel_symbols_by_column_name: BTreeMap<String, String>,
    #[serde(rename = "sample cohorts")]
    sample_cohorts: SampleCohorts,
}

/// Counts from one export run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub studies: usize,
    pub written: Vec<PathBuf>,
    pub skipped_specimens: Vec<String>,
}

/// Write a table as tab-separated text.
pub fn write_tsv(path: impl AsRef<Path>, table: &MatrixTable) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| TesseraError::Other(format!("{}: {}", path.display(), e)))?;
    writer
        .write_record(&table.header)
        .map_err(|e| TesseraError::Other(e.to_string()))?;
    for row in &table.rows {
        writer.write_record(row).map_err(|e| TesseraError::Other(e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

impl Store {
    /// Export matrices of every requested study into `directory`.
    ///
    /// A specimen that fails with a specimen-scoped error is logged and left
    /// out of the index; other errors abort the export.
    pub fn export_feature_matrices(
        &self,
        directory: impl AsRef<Path>,
        options: &ExportOptions,
    ) -> Result<ExportSummary> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;
        let studies = match &options.study {
            Some(study) => vec![study.clone()],
            None => self.study_names()?,
        };

        let mut summary = ExportSummary::default();
        let mut index: BTreeMap<String, StudyIndex> = BTreeMap::new();
        for (k, study) in studies.iter().enumerate() {
            let components = self.study_components(study)?;
            let channels = self.channels(&components.measurement)?;
            let phenotypes = if options.include_phenotypes {
                channels.compile(&self.phenotypes(&components.measurement, &channels)?)?
            } else {
                Vec::new()
            };

            let mut matrices = BTreeMap::new();
            for (j, specimen) in self.specimens(&components.measurement)?.iter().enumerate() {
                let matrix = match self.feature_matrix(specimen, &channels, options.include_intensities) {
                    Ok(m) => m,
                    Err(e) if e.is_specimen_scoped() => {
                        error!(specimen = %specimen, "skipping specimen: {}", e);
                        summary.skipped_specimens.push(specimen.clone());
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let filename = format!("{}.{}.tsv", k, j);
                let path = directory.join(&filename);
                write_tsv(&path, &matrix.to_table(options.mode, &phenotypes))?;
                matrices.insert(
                    specimen.clone(),
                    MatrixEntry {
                        filename,
                        cells: matrix.len(),
                    },
                );
                summary.written.push(path);
            }

            let channel_symbols_by_column_name = channels
                .symbols()
                .map(|s| (format!("C {}", s), s.to_string()))
                .collect();
            let assignments = self
                .stratum_assignments(study)?
                .into_iter()
                .map(|a| (a.specimen, a.stratum))
                .collect();
            index.insert(
                study.clone(),
                StudyIndex {
                    feature_matrices: matrices,
                    channel_symbols_by_column_name,
                    sample_cohorts: SampleCohorts {
                        assignments,
                        strata: self.strata(study)?,
                    },
                },
            );
            summary.studies += 1;
        }

        let json = serde_json::to_string_pretty(&index).map_err(|e| TesseraError::Other(e.to_string()))?;
        fs::write(directory.join(INDEX_FILE_NAME), json)?;
        info!(
            studies = summary.studies,
            files = summary.written.len(),
            skipped = summary.skipped_specimens.len(),
            "exported feature matrices"
        );
        Ok(summary)
    }
}
