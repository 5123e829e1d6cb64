//! Bulk writers populating the store.
//!
//! Importers parse vendor tables elsewhere and hand these records over. Each
//! writer runs in one transaction with cached prepared statements and
//! `ON CONFLICT DO NOTHING`, so re-running an import is harmless.

use std::path::Path;

use rusqlite::params;
use tracing::debug;

use tessera_core::hash::sha256_file;
use tessera_core::{Result, TesseraError};
use tessera_spatial::shape::{Polygon, SHAPE_FILE_FORMAT};
use tessera_spatial::signature::Polarity;

use crate::store::{db_err, Store};

/// A primary study and its collection and measurement components.
#[derive(Debug, Clone)]
pub struct StudyRecord {
    pub name: String,
    pub institution: String,
    pub collection_study: String,
    pub measurement_study: String,
}

#[derive(Debug, Clone)]
pub struct SubjectRecord {
    pub identifier: String,
    pub sex: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpecimenRecord {
    pub specimen: String,
    pub subject: String,
    pub extraction_date: String,
    pub collection_study: String,
}

/// One measurement of a specimen and the cell manifest it produced.
#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    pub identifier: String,
    pub specimen: String,
    pub measurement_study: String,
    pub manifest_sha256: String,
    pub manifest_file_name: String,
    pub manifest_size: i64,
}

impl MeasurementRecord {
    /// Describe the manifest at `path` by its content hash, file name and size.
    pub fn from_manifest_file(
        identifier: &str,
        specimen: &str,
        measurement_study: &str,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let manifest_size = std::fs::metadata(path)?.len() as i64;
        let manifest_file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TesseraError::InvalidInput(format!("no file name in {}", path.display())))?;
        Ok(Self {
            identifier: identifier.to_string(),
            specimen: specimen.to_string(),
            measurement_study: measurement_study.to_string(),
            manifest_sha256: sha256_file(path)?,
            manifest_file_name,
            manifest_size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub identifier: i64,
    pub symbol: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhenotypeRecord {
    pub identifier: String,
    pub name: String,
    pub criteria: Vec<(i64, Polarity)>,
}

/// One (channel, call, intensity) measurement of a cell.
#[derive(Debug, Clone, Copy)]
pub struct Quantification {
    pub channel: i64,
    pub positive: bool,
    pub intensity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CellRecord {
    pub structure: i64,
    pub shape: Polygon,
    pub compartment: Option<String>,
    pub quantifications: Vec<Quantification>,
}

#[derive(Debug, Clone)]
pub struct DiagnosisRecord {
    pub subject: String,
    pub condition: String,
    pub result: String,
    pub date_of_evidence: String,
}

#[derive(Debug, Clone)]
pub struct InterventionRecord {
    pub subject: String,
    pub specifier: String,
    pub date: String,
}

impl Store {
    pub fn insert_study(&mut self, study: &StudyRecord) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO study (study_specifier, institution) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![study.name, study.institution],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO specimen_collection_study (name) VALUES (?1) ON CONFLICT DO NOTHING",
            params![study.collection_study],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO specimen_measurement_study (name) VALUES (?1) ON CONFLICT DO NOTHING",
            params![study.measurement_study],
        )
        .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO study_component (primary_study, component_study) VALUES (?1, ?2) \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for component in [&study.collection_study, &study.measurement_study] {
                stmt.execute(params![study.name, component]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    pub fn insert_subjects(&mut self, subjects: &[SubjectRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO subject (identifier, sex) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for s in subjects {
                stmt.execute(params![s.identifier, s.sex]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    pub fn insert_specimens(&mut self, specimens: &[SpecimenRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO specimen_collection_process (specimen, source, extraction_date, study) \
                     VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for s in specimens {
                stmt.execute(params![s.specimen, s.subject, s.extraction_date, s.collection_study])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    /// Measurement processes together with their cell manifest files.
    pub fn insert_measurements(&mut self, measurements: &[MeasurementRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut process = tx
                .prepare_cached(
                    "INSERT INTO specimen_data_measurement_process (identifier, specimen, study) \
                     VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut file = tx
                .prepare_cached(
                    "INSERT INTO data_file (sha256_hash, file_name, file_format, contents_format, size, \
                     source_generation_process) VALUES (?1, ?2, 'CSV', 'cell manifest', ?3, ?4) \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for m in measurements {
                process
                    .execute(params![m.identifier, m.specimen, m.measurement_study])
                    .map_err(db_err)?;
                file.execute(params![m.manifest_sha256, m.manifest_file_name, m.manifest_size, m.identifier])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    /// Channels and their assignment to a measurement study.
    pub fn insert_channels(&mut self, measurement_study: &str, channels: &[ChannelRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut species = tx
                .prepare_cached(
                    "INSERT INTO chemical_species (identifier, symbol, full_name) VALUES (?1, ?2, ?3) \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut marking = tx
                .prepare_cached(
                    "INSERT INTO biological_marking_system (target, study) VALUES (?1, ?2) \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for c in channels {
                species
                    .execute(params![c.identifier, c.symbol, c.full_name])
                    .map_err(db_err)?;
                marking
                    .execute(params![c.identifier, measurement_study])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    pub fn insert_phenotypes(&mut self, measurement_study: &str, phenotypes: &[PhenotypeRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut phenotype = tx
                .prepare_cached(
                    "INSERT INTO cell_phenotype (identifier, name) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut criterion = tx
                .prepare_cached(
                    "INSERT INTO cell_phenotype_criterion (cell_phenotype, marker, polarity, study) \
                     VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for p in phenotypes {
                phenotype.execute(params![p.identifier, p.name]).map_err(db_err)?;
                for (marker, polarity) in &p.criteria {
                    criterion
                        .execute(params![p.identifier, marker, polarity.as_str(), measurement_study])
                        .map_err(db_err)?;
                }
            }
        }
        tx.commit().map_err(db_err)
    }

    /// Cells of one manifest: structure, shape file, identification and the
    /// expression rows. The shape file shares the structure's identifier.
    pub fn insert_cells(&mut self, manifest_sha256: &str, cells: &[CellRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut structure = tx
                .prepare_cached(
                    "INSERT INTO histological_structure (identifier, anatomical_entity) VALUES (?1, 'cell') \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut shape = tx
                .prepare_cached(
                    "INSERT INTO shape_file (identifier, geometry_file_format, base64_contents) \
                     VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut identification = tx
                .prepare_cached(
                    "INSERT INTO histological_structure_identification \
                     (histological_structure, data_source, shape_file, compartment) \
                     VALUES (?1, ?2, ?1, ?3) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            let mut quantification = tx
                .prepare_cached(
                    "INSERT INTO expression_quantification \
                     (histological_structure, target, quantity, discrete_value) \
                     VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for cell in cells {
                structure.execute(params![cell.structure]).map_err(db_err)?;
                shape
                    .execute(params![cell.structure, SHAPE_FILE_FORMAT, cell.shape.to_base64()])
                    .map_err(db_err)?;
                identification
                    .execute(params![cell.structure, manifest_sha256, cell.compartment])
                    .map_err(db_err)?;
                for q in &cell.quantifications {
                    let call = if q.positive { "positive" } else { "negative" };
                    quantification
                        .execute(params![cell.structure, q.channel, q.intensity, call])
                        .map_err(db_err)?;
                }
            }
        }
        tx.commit().map_err(db_err)?;
        debug!(manifest = manifest_sha256, cells = cells.len(), "inserted cells");
        Ok(())
    }

    pub fn insert_diagnoses(&mut self, diagnoses: &[DiagnosisRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO diagnosis (subject, diagnosed_condition, diagnosis, date_of_evidence) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            for d in diagnoses {
                stmt.execute(params![d.subject, d.condition, d.result, d.date_of_evidence])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    pub fn insert_interventions(&mut self, interventions: &[InterventionRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO intervention (subject, specifier, date) VALUES (?1, ?2, ?3)")
                .map_err(db_err)?;
            for i in interventions {
                stmt.execute(params![i.subject, i.specifier, i.date]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }
}
