//! Connection handling and read access to the relational store.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use tessera_core::{Result, TesseraError};
use tessera_spatial::shape::Polygon;
use tessera_spatial::signature::{Channel, ChannelIndex, Phenotype, PhenotypeCriteria, Polarity};
use tessera_spatial::{assemble_feature_matrix, CellGeometry, ExpressionRow, FeatureMatrix};

use crate::credentials::DbCredentials;

/// Endpoint value that selects an in-memory store.
pub const IN_MEMORY_ENDPOINT: &str = ":memory:";

pub(crate) fn db_err(e: rusqlite::Error) -> TesseraError {
    TesseraError::Database(e.to_string())
}

/// Component studies of one primary study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyComponents {
    pub study: String,
    pub collection: String,
    pub measurement: String,
    /// Data-analysis components registered so far.
    pub analyses: Vec<String>,
}

impl StudyComponents {
    /// Name of the data-analysis study that receives computed features.
    pub fn analysis_study_name(&self) -> String {
        format!("{} - data analysis", self.study)
    }
}

/// Handle on the relational store. One connection; not shared across threads.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=memory;",
        )
        .map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    /// Open the store named by a credentials file: `<endpoint>/<database>.sqlite3`,
    /// or an in-memory store for the `:memory:` endpoint.
    pub fn from_credentials(credentials: &DbCredentials) -> Result<Self> {
        debug!(user = %credentials.user, "opening store");
        if credentials.endpoint == IN_MEMORY_ENDPOINT {
            return Self::open_in_memory();
        }
        let dir = Path::new(&credentials.endpoint);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.sqlite3", credentials.database));
        info!(path = %path.display(), "opening store");
        Self::open(path)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql")).map_err(db_err)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Studies
    // ------------------------------------------------------------------

    /// Primary study names, sorted.
    pub fn study_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT study_specifier FROM study ORDER BY study_specifier")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
    }

    /// Resolve a primary study into its components. Unknown names are
    /// configuration errors.
    pub fn study_components(&self, study: &str) -> Result<StudyComponents> {
        let known: Option<String> = self
            .conn
            .query_row(
                "SELECT study_specifier FROM study WHERE study_specifier = ?1",
                params![study],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if known.is_none() {
            return Err(TesseraError::Config(format!("unknown study '{}'", study)));
        }

        let component = |table: &str| -> Result<Vec<String>> {
            let sql = format!(
                "SELECT sc.component_study FROM study_component sc \
                 JOIN {} t ON t.name = sc.component_study \
                 WHERE sc.primary_study = ?1 ORDER BY sc.component_study",
                table
            );
            let mut stmt = self.conn.prepare_cached(&sql).map_err(db_err)?;
            let rows = stmt.query_map(params![study], |row| row.get(0)).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
        };
        let first = |table: &str| -> Result<String> {
            component(table)?.into_iter().next().ok_or_else(|| {
                TesseraError::Config(format!("study '{}' has no {} component", study, table))
            })
        };

        Ok(StudyComponents {
            study: study.to_string(),
            collection: first("specimen_collection_study")?,
            measurement: first("specimen_measurement_study")?,
            analyses: component("data_analysis_study")?,
        })
    }

    /// Whether a data-analysis study of this name exists.
    pub fn data_analysis_study_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM data_analysis_study WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Register `"<study> - data analysis"` as a component of `study` if absent.
    pub fn ensure_data_analysis_study(&mut self, components: &StudyComponents) -> Result<String> {
        let name = components.analysis_study_name();
        let tx = self.conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO data_analysis_study (name) VALUES (?1) ON CONFLICT DO NOTHING",
            params![name],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO study_component (primary_study, component_study) VALUES (?1, ?2) \
             ON CONFLICT DO NOTHING",
            params![components.study, name],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Specimens, channels, phenotypes
    // ------------------------------------------------------------------

    /// Specimens measured in a measurement study, sorted.
    pub fn specimens(&self, measurement_study: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT DISTINCT specimen FROM specimen_data_measurement_process \
                 WHERE study = ?1 ORDER BY specimen",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![measurement_study], |row| row.get(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
    }

    /// Every specimen known to the store.
    pub fn all_specimens(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT specimen FROM specimen_collection_process ORDER BY specimen")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
    }

    /// Channels of a measurement study, bit positions by ascending identifier.
    pub fn channels(&self, measurement_study: &str) -> Result<ChannelIndex> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT cs.identifier, cs.symbol FROM chemical_species cs \
                 JOIN biological_marking_system bms ON bms.target = cs.identifier \
                 WHERE bms.study = ?1 ORDER BY cs.identifier",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![measurement_study], |row| {
                Ok(Channel::new(row.get(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        let channels = rows.collect::<rusqlite::Result<Vec<Channel>>>().map_err(db_err)?;
        ChannelIndex::new(channels).map_err(|e| TesseraError::StoreConsistency(e.to_string()))
    }

    /// Named composite phenotypes of a study, sorted by name.
    ///
    /// A criterion on a channel outside `channels` violates the store's
    /// referential integrity.
    pub fn phenotypes(&self, measurement_study: &str, channels: &ChannelIndex) -> Result<Vec<Phenotype>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT cp.name, cpc.marker, cpc.polarity FROM cell_phenotype_criterion cpc \
                 JOIN cell_phenotype cp ON cp.identifier = cpc.cell_phenotype \
                 WHERE cpc.study = ?1 ORDER BY cp.name, cpc.marker",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![measurement_study], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut criteria: BTreeMap<String, PhenotypeCriteria> = BTreeMap::new();
        for row in rows {
            let (name, marker, polarity) = row.map_err(db_err)?;
            let symbol = channels
                .bit_for_id(marker)
                .map(|bit| channels.channels()[bit as usize].symbol.clone())
                .ok_or_else(|| {
                    TesseraError::StoreConsistency(format!(
                        "phenotype '{}' references channel {} outside study '{}'",
                        name, marker, measurement_study
                    ))
                })?;
            let polarity: Polarity = polarity
                .parse()
                .map_err(|_| TesseraError::StoreConsistency(format!("bad polarity '{}'", polarity)))?;
            criteria.entry(name).or_default().add(symbol, polarity);
        }
        criteria
            .into_iter()
            .map(|(name, c)| Phenotype::new(name, c))
            .collect()
    }

    /// Single-marker phenotypes for every channel, then the named composites.
    pub fn phenotype_universe(&self, measurement_study: &str, channels: &ChannelIndex) -> Result<Vec<Phenotype>> {
        let mut all = channels.single_marker_phenotypes();
        all.extend(self.phenotypes(measurement_study, channels)?);
        Ok(all)
    }

    // ------------------------------------------------------------------
    // Cells
    // ------------------------------------------------------------------

    /// Expression calls of a specimen ordered by (structure, channel).
    pub fn expression_rows(&self, specimen: &str) -> Result<Vec<ExpressionRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT eq.histological_structure, eq.target, eq.discrete_value, eq.quantity \
                 FROM expression_quantification eq \
                 JOIN histological_structure_identification hsi \
                   ON hsi.histological_structure = eq.histological_structure \
                 JOIN data_file df ON df.sha256_hash = hsi.data_source \
                 JOIN specimen_data_measurement_process sdmp \
                   ON sdmp.identifier = df.source_generation_process \
                 WHERE sdmp.specimen = ?1 \
                 ORDER BY eq.histological_structure, eq.target",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![specimen], |row| {
                Ok(ExpressionRow {
                    structure: row.get(0)?,
                    channel: row.get(1)?,
                    positive: row.get::<_, String>(2)? == "positive",
                    intensity: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Centroid, area, compartment and manifest of every cell of a specimen.
    pub fn cell_geometry(&self, specimen: &str) -> Result<Vec<CellGeometry>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT hsi.histological_structure, sf.base64_contents, hsi.compartment, df.sha256_hash \
                 FROM histological_structure_identification hsi \
                 JOIN data_file df ON df.sha256_hash = hsi.data_source \
                 JOIN specimen_data_measurement_process sdmp \
                   ON sdmp.identifier = df.source_generation_process \
                 LEFT JOIN shape_file sf ON sf.identifier = hsi.shape_file \
                 WHERE sdmp.specimen = ?1 \
                 ORDER BY hsi.histological_structure",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![specimen], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut cells = Vec::new();
        for row in rows {
            let (structure, shape, compartment, manifest) = row.map_err(db_err)?;
            let shape = shape.ok_or_else(|| {
                TesseraError::StoreConsistency(format!("structure {} has no shape file", structure))
            })?;
            let polygon = Polygon::from_base64(&shape).map_err(|e| {
                TesseraError::MalformedShape(format!("structure {} in {}: {}", structure, manifest, e))
            })?;
            cells.push(CellGeometry {
                structure,
                centroid: polygon.centroid(),
                area: polygon.area(),
                compartment,
                manifest,
            });
        }
        Ok(cells)
    }

    /// Pull and assemble one specimen's feature matrix.
    pub fn feature_matrix(
        &self,
        specimen: &str,
        channels: &ChannelIndex,
        include_intensities: bool,
    ) -> Result<FeatureMatrix> {
        let expression = self.expression_rows(specimen)?;
        let cells = self.cell_geometry(specimen)?;
        debug!(
            specimen,
            expression_rows = expression.len(),
            cells = cells.len(),
            "pulled specimen"
        );
        assemble_feature_matrix(specimen, channels, expression, cells, include_intensities)
    }
}
