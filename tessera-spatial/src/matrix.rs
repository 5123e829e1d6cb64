//! Per-specimen feature matrices.
//!
//! A [`FeatureMatrix`] joins the expression calls of a specimen (folded into
//! one [`Expression`] per histological structure) with the cell geometry
//! decoded from its shape file. Rows are ordered by structure id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use tessera_core::{Result, TesseraError};

use crate::shape::Point;
use crate::signature::{ChannelIndex, Expression, PhenotypeSignature, Signature};

/// One (structure, channel) expression call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionRow {
    pub structure: i64,
    pub channel: i64,
    pub positive: bool,
    pub intensity: Option<f64>,
}

/// Geometry and provenance of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGeometry {
    pub structure: i64,
    pub centroid: Point,
    /// Polygon area in px².
    pub area: f64,
    pub compartment: Option<String>,
    /// sha256 of the cell manifest the structure came from.
    pub manifest: String,
}

/// A compartment filter: one named region or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Compartment {
    All,
    Named(String),
}

impl Compartment {
    pub fn label(&self) -> &str {
        match self {
            Compartment::All => "all",
            Compartment::Named(name) => name,
        }
    }

    pub fn contains(&self, cell_compartment: Option<&str>) -> bool {
        match self {
            Compartment::All => true,
            Compartment::Named(name) => cell_compartment == Some(name.as_str()),
        }
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Channel encoding of an exported matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingMode {
    /// A single `expression` column holding the integer `e`.
    Packed,
    /// One `C <symbol>` 0/1 column per channel.
    #[default]
    Expanded,
}

impl FromStr for EncodingMode {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "packed" => Ok(EncodingMode::Packed),
            "expanded" => Ok(EncodingMode::Expanded),
            other => Err(TesseraError::InvalidInput(format!(
                "unknown encoding mode '{}'",
                other
            ))),
        }
    }
}

/// Header plus stringified rows, ready for TSV output.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Dense per-specimen cell table.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    specimen: String,
    channels: ChannelIndex,
    structures: Vec<i64>,
    points: Vec<Point>,
    expressions: Vec<Expression>,
    areas: Vec<f64>,
    compartments: Vec<Option<String>>,
    manifests: Vec<String>,
    /// Intensity columns in channel order; `None` for dropped columns.
    intensities: Option<Vec<Option<Vec<f64>>>>,
    dropped_rows: usize,
}

#[derive(Default)]
struct Fold {
    bits: Expression,
    seen: Expression,
    intensities: Vec<f64>,
}

/// Fold expression rows and left-join geometry into a [`FeatureMatrix`].
///
/// Rows whose centroid is not finite are dropped (logged at info); with
/// `include_intensities`, intensity columns containing NaN or missing values
/// are dropped (logged as warnings).
pub fn assemble_feature_matrix(
    specimen: &str,
    channels: &ChannelIndex,
    expression: impl IntoIterator<Item = ExpressionRow>,
    cells: Vec<CellGeometry>,
    include_intensities: bool,
) -> Result<FeatureMatrix> {
    let n_channels = channels.len();
    let mut folds: BTreeMap<i64, Fold> = BTreeMap::new();
    for row in expression {
        let bit = channels
            .bit_for_id(row.channel)
            .ok_or(TesseraError::MissingChannelMapping(row.channel))?;
        let fold = folds.entry(row.structure).or_insert_with(|| Fold {
            intensities: if include_intensities {
                vec![f64::NAN; n_channels]
            } else {
                Vec::new()
            },
            ..Fold::default()
        });
        let flag: Expression = 1 << bit;
        fold.seen |= flag;
        if row.positive {
            fold.bits |= flag;
        }
        if include_intensities {
            fold.intensities[bit as usize] = row.intensity.unwrap_or(f64::NAN);
        }
    }

    let geometry: HashMap<i64, CellGeometry> =
        cells.into_iter().map(|c| (c.structure, c)).collect();
    if geometry.len() != folds.len() {
        return Err(TesseraError::InconsistentCellCount {
            specimen: specimen.to_string(),
            centroids: geometry.len(),
            expressions: folds.len(),
        });
    }

    let full = channels.full_mask();
    let mut matrix = FeatureMatrix {
        specimen: specimen.to_string(),
        channels: channels.clone(),
        structures: Vec::with_capacity(folds.len()),
        points: Vec::with_capacity(folds.len()),
        expressions: Vec::with_capacity(folds.len()),
        areas: Vec::with_capacity(folds.len()),
        compartments: Vec::with_capacity(folds.len()),
        manifests: Vec::with_capacity(folds.len()),
        intensities: None,
        dropped_rows: 0,
    };
    let mut intensity_rows: Vec<Vec<f64>> = Vec::new();

    for (structure, fold) in folds {
        if fold.seen != full {
            let missing = (full & !fold.seen).count_ones();
            return Err(TesseraError::StoreConsistency(format!(
                "structure {} in specimen {} lacks expression for {} channel(s)",
                structure, specimen, missing
            )));
        }
        let cell = geometry.get(&structure).ok_or_else(|| {
            TesseraError::StoreConsistency(format!(
                "structure {} in specimen {} has no shape",
                structure, specimen
            ))
        })?;
        if !cell.centroid.is_finite() {
            matrix.dropped_rows += 1;
            continue;
        }
        matrix.structures.push(structure);
        matrix.points.push(cell.centroid);
        matrix.expressions.push(fold.bits);
        matrix.areas.push(cell.area);
        matrix.compartments.push(cell.compartment.clone());
        matrix.manifests.push(cell.manifest.clone());
        if include_intensities {
            intensity_rows.push(fold.intensities);
        }
    }

    if matrix.dropped_rows > 0 {
        info!(
            specimen,
            dropped = matrix.dropped_rows,
            "dropped cells with undefined centroids"
        );
    }

    if include_intensities {
        let columns = (0..n_channels)
            .map(|c| {
                let column: Vec<f64> = intensity_rows.iter().map(|r| r[c]).collect();
                if column.iter().any(|v| v.is_nan()) {
                    let defects = column.iter().filter(|v| v.is_nan()).count();
                    warn!(
                        specimen,
                        channel = %channels.channels()[c].symbol,
                        defects,
                        "dropped intensity column with missing values"
                    );
                    None
                } else {
                    Some(column)
                }
            })
            .collect();
        matrix.intensities = Some(columns);
    }

    debug!(specimen, cells = matrix.len(), "assembled feature matrix");
    Ok(matrix)
}

impl FeatureMatrix {
    pub fn specimen(&self) -> &str {
        &self.specimen
    }

    pub fn channels(&self) -> &ChannelIndex {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    pub fn structure_ids(&self) -> &[i64] {
        &self.structures
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn expressions(&self) -> &[Expression] {
        &self.expressions
    }

    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    pub fn compartment(&self, row: usize) -> Option<&str> {
        self.compartments[row].as_deref()
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    /// Distinct compartment names present, sorted.
    pub fn compartment_names(&self) -> Vec<String> {
        self.compartments
            .iter()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Row indices grouped by manifest, in manifest-hash order.
    pub fn manifest_partitions(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (row, manifest) in self.manifests.iter().enumerate() {
            groups.entry(manifest.as_str()).or_default().push(row);
        }
        groups
            .into_iter()
            .map(|(m, rows)| (m.to_string(), rows))
            .collect()
    }

    /// Whether each row in `rows` matches `signature` (signed partial).
    pub fn phenotype_mask(&self, rows: &[usize], signature: &Signature) -> Vec<bool> {
        rows.iter()
            .map(|&r| signature.matches(self.expressions[r]))
            .collect()
    }

    pub fn compartment_mask(&self, rows: &[usize], compartment: &Compartment) -> Vec<bool> {
        rows.iter()
            .map(|&r| compartment.contains(self.compartment(r)))
            .collect()
    }

    /// Render the matrix: `histological structure`, `pixel x`, `pixel y`,
    /// the channel encoding, surviving `I <symbol>` columns, then one 0/1
    /// column per requested phenotype.
    pub fn to_table(&self, mode: EncodingMode, phenotypes: &[PhenotypeSignature]) -> MatrixTable {
        let mut header = vec![
            "histological structure".to_string(),
            "pixel x".to_string(),
            "pixel y".to_string(),
        ];
        match mode {
            EncodingMode::Packed => header.push("expression".to_string()),
            EncodingMode::Expanded => {
                header.extend(self.channels.symbols().map(|s| format!("C {}", s)))
            }
        }
        let intensity_columns: Vec<(usize, &Vec<f64>)> = self
            .intensities
            .iter()
            .flatten()
            .enumerate()
            .filter_map(|(c, col)| col.as_ref().map(|col| (c, col)))
            .collect();
        for (c, _) in &intensity_columns {
            header.push(format!("I {}", self.channels.channels()[*c].symbol));
        }
        header.extend(phenotypes.iter().map(|p| p.name.clone()));

        let flag = |b: bool| if b { "1".to_string() } else { "0".to_string() };
        let rows = (0..self.len())
            .map(|r| {
                let e = self.expressions[r];
                let mut row = vec![
                    self.structures[r].to_string(),
                    self.points[r].x.to_string(),
                    self.points[r].y.to_string(),
                ];
                match mode {
                    EncodingMode::Packed => row.push(e.to_string()),
                    EncodingMode::Expanded => {
                        row.extend((0..self.channels.len()).map(|bit| flag(e & (1 << bit) != 0)))
                    }
                }
                row.extend(intensity_columns.iter().map(|(_, col)| col[r].to_string()));
                row.extend(phenotypes.iter().map(|p| flag(p.signature.matches(e))));
                row
            })
            .collect();

        MatrixTable { header, rows }
    }
}

/// Small matrices for unit tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::signature::{Channel, PhenotypeCriteria};

    /// A specimen whose cells are (x, y, space-separated positive symbols,
    /// compartment, manifest).
    pub fn matrix(symbols: &[&str], cells: &[(f64, f64, &str, Option<&str>, &str)]) -> FeatureMatrix {
        let channels = ChannelIndex::new(
            symbols
                .iter()
                .enumerate()
                .map(|(i, s)| Channel::new(i as i64 + 1, *s)),
        )
        .unwrap();
        let mut expression = Vec::new();
        let mut geometry = Vec::new();
        for (i, (x, y, positives, compartment, manifest)) in cells.iter().enumerate() {
            let structure = i as i64 + 100;
            for (c, s) in symbols.iter().enumerate() {
                expression.push(ExpressionRow {
                    structure,
                    channel: c as i64 + 1,
                    positive: positives.split_whitespace().any(|p| p == *s),
                    intensity: None,
                });
            }
            geometry.push(CellGeometry {
                structure,
                centroid: Point::new(*x, *y),
                area: 1.0,
                compartment: compartment.map(str::to_string),
                manifest: manifest.to_string(),
            });
        }
        assemble_feature_matrix("specimen", &channels, expression, geometry, false).unwrap()
    }

    pub fn phenotype(matrix: &FeatureMatrix, name: &str, symbol: &str) -> PhenotypeSignature {
        PhenotypeSignature {
            name: name.to_string(),
            signature: matrix
                .channels()
                .signature(&PhenotypeCriteria::single_marker(symbol))
                .unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Channel;

    fn channels() -> ChannelIndex {
        ChannelIndex::new(vec![Channel::new(1, "CD3"), Channel::new(2, "CD8")]).unwrap()
    }

    fn expr(structure: i64, channel: i64, positive: bool, intensity: Option<f64>) -> ExpressionRow {
        ExpressionRow {
            structure,
            channel,
            positive,
            intensity,
        }
    }

    fn cell(structure: i64, x: f64, y: f64) -> CellGeometry {
        CellGeometry {
            structure,
            centroid: Point::new(x, y),
            area: 4.0,
            compartment: Some("Tumor".into()),
            manifest: "abc".into(),
        }
    }

    fn rows() -> Vec<ExpressionRow> {
        vec![
            expr(20, 1, true, Some(3.5)),
            expr(20, 2, false, Some(0.1)),
            expr(10, 1, true, Some(2.0)),
            expr(10, 2, true, None),
        ]
    }

    #[test]
    fn folds_bits_and_orders_by_structure() {
        let m = assemble_feature_matrix(
            "s1",
            &channels(),
            rows(),
            vec![cell(20, 1.0, 2.0), cell(10, 3.0, 4.0)],
            false,
        )
        .unwrap();
        assert_eq!(m.structure_ids(), &[10, 20]);
        assert_eq!(m.expressions(), &[0b11, 0b01]);
        assert_eq!(m.points()[0], Point::new(3.0, 4.0));
        assert_eq!(m.compartment_names(), vec!["Tumor".to_string()]);
    }

    #[test]
    fn expanded_and_packed_tables() {
        let m = assemble_feature_matrix(
            "s1",
            &channels(),
            rows(),
            vec![cell(20, 1.0, 2.0), cell(10, 3.5, 4.0)],
            false,
        )
        .unwrap();
        let t8 = PhenotypeSignature {
            name: "CD8 T cell".into(),
            signature: m
                .channels()
                .signature(&crate::signature::PhenotypeCriteria::new(["CD3", "CD8"], Vec::<String>::new()))
                .unwrap(),
        };
        let expanded = m.to_table(EncodingMode::Expanded, &[t8.clone()]);
        assert_eq!(
            expanded.header,
            vec!["histological structure", "pixel x", "pixel y", "C CD3", "C CD8", "CD8 T cell"]
        );
        assert_eq!(expanded.rows[0], vec!["10", "3.5", "4", "1", "1", "1"]);
        assert_eq!(expanded.rows[1], vec!["20", "1", "2", "1", "0", "0"]);

        let packed = m.to_table(EncodingMode::Packed, &[]);
        assert_eq!(packed.header[3], "expression");
        assert_eq!(packed.rows[0][3], "3");
        assert_eq!(m.to_table(EncodingMode::Packed, &[]), packed);
    }

    #[test]
    fn intensity_column_with_gap_is_dropped() {
        let m = assemble_feature_matrix(
            "s1",
            &channels(),
            rows(),
            vec![cell(20, 1.0, 2.0), cell(10, 3.0, 4.0)],
            true,
        )
        .unwrap();
        let t = m.to_table(EncodingMode::Expanded, &[]);
        assert_eq!(t.header.last().unwrap(), "I CD3");
        assert_eq!(t.rows[0].last().unwrap(), "2");
    }

    #[test]
    fn nan_centroid_drops_row() {
        let m = assemble_feature_matrix(
            "s1",
            &channels(),
            rows(),
            vec![cell(20, f64::NAN, 2.0), cell(10, 3.0, 4.0)],
            false,
        )
        .unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.dropped_rows(), 1);
    }

    #[test]
    fn unknown_channel_id() {
        let mut r = rows();
        r.push(expr(10, 99, true, None));
        let err = assemble_feature_matrix("s1", &channels(), r, vec![cell(20, 0.0, 0.0), cell(10, 0.0, 0.0)], false)
            .unwrap_err();
        assert!(matches!(err, TesseraError::MissingChannelMapping(99)));
    }

    #[test]
    fn cell_count_mismatch() {
        let err = assemble_feature_matrix("s1", &channels(), rows(), vec![cell(10, 0.0, 0.0)], false)
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::InconsistentCellCount { centroids: 1, expressions: 2, .. }
        ));
    }

    #[test]
    fn incomplete_expression_set() {
        let r = vec![expr(10, 1, true, None), expr(20, 1, true, None), expr(20, 2, true, None)];
        let err = assemble_feature_matrix(
            "s1",
            &channels(),
            r,
            vec![cell(10, 0.0, 0.0), cell(20, 0.0, 0.0)],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, TesseraError::StoreConsistency(ref m) if m.contains("structure 10")));
    }

    #[test]
    fn manifests_partition_rows() {
        let m = fixtures::matrix(
            &["X"],
            &[
                (0.0, 0.0, "X", None, "b"),
                (1.0, 0.0, "", None, "a"),
                (2.0, 0.0, "X", None, "b"),
            ],
        );
        let parts = m.manifest_partitions();
        assert_eq!(parts, vec![("a".to_string(), vec![1]), ("b".to_string(), vec![0, 2])]);
    }

    #[test]
    fn compartment_filter() {
        assert!(Compartment::All.contains(None));
        assert!(Compartment::Named("Tumor".into()).contains(Some("Tumor")));
        assert!(!Compartment::Named("Tumor".into()).contains(None));
        assert_eq!(Compartment::All.to_string(), "all");
        assert_eq!("packed".parse::<EncodingMode>().unwrap(), EncodingMode::Packed);
    }
}
