//! Spatial autocorrelation of channel positivity.
//!
//! Moran's I over a binary radius graph: two cells are neighbors when their
//! centroids lie within the radius of each other (a cell is never its own
//! neighbor). The statistic is computed per manifest and combined across
//! manifests as a cell-count-weighted mean.

use tracing::{debug, error, info};

use tessera_core::{Result, TesseraError};
use tessera_stats::distribution::Normal;

use crate::features::{DerivationMethod, FeatureBatch};
use crate::index::IndexBuilder;
use crate::matrix::FeatureMatrix;
use crate::shape::Point;

pub const DEFAULT_AUTOCORRELATION_RADIUS: f64 = 50.0;

/// Symmetric binary adjacency over a point set.
#[derive(Debug, Clone)]
pub struct SpatialGraph {
    neighbors: Vec<Vec<usize>>,
}

impl SpatialGraph {
    /// Radius graph built from the index's inclusive radius query.
    pub fn within_radius(points: &[Point], radius: f64, builder: &dyn IndexBuilder) -> Self {
        let index = builder.build(points);
        let neighbors = index
            .within_radius(points, radius)
            .into_iter()
            .enumerate()
            .map(|(i, hits)| hits.into_iter().filter(|&j| j != i).collect())
            .collect();
        Self { neighbors }
    }

    pub fn n_nodes(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.neighbors[i]
    }

    /// Number of directed edges (twice the undirected edge count).
    pub fn total_weight(&self) -> usize {
        self.neighbors.iter().map(Vec::len).sum()
    }
}

/// Moran's I with its normality-assumption moments.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MoransI {
    pub statistic: f64,
    pub expected: f64,
    pub variance: f64,
    pub z_score: f64,
    pub p_value: f64,
}

/// Moran's I of `values` over `graph`.
///
/// Fewer than four nodes or a graph without edges is `DegenerateInput`;
/// constant values are `NumericInstability`.
pub fn morans_i(values: &[f64], graph: &SpatialGraph) -> Result<MoransI> {
    let n = graph.n_nodes();
    if values.len() != n {
        return Err(TesseraError::InvalidInput(format!(
            "values length ({}) does not match graph size ({})",
            values.len(),
            n
        )));
    }
    if n < 4 {
        return Err(TesseraError::DegenerateInput(format!(
            "Moran's I needs at least 4 cells, got {}",
            n
        )));
    }

    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let dev: Vec<f64> = values.iter().map(|v| v - mean).collect();
    let sum_sq: f64 = dev.iter().map(|d| d * d).sum();
    if sum_sq < 1e-30 {
        return Err(TesseraError::NumericInstability(
            "constant values, Moran's I undefined".into(),
        ));
    }

    let w = graph.total_weight() as f64;
    if w == 0.0 {
        return Err(TesseraError::DegenerateInput("radius graph has no edges".into()));
    }

    let mut cross = 0.0;
    for i in 0..n {
        for &j in graph.neighbors(i) {
            cross += dev[i] * dev[j];
        }
    }
    let statistic = (nf / w) * cross / sum_sq;
    let expected = -1.0 / (nf - 1.0);

    // Symmetric 0/1 weights: S1 = 2W, S2 = Σ (2 deg_i)^2.
    let s1 = 2.0 * w;
    let s2: f64 = (0..n)
        .map(|i| (2.0 * graph.neighbors(i).len() as f64).powi(2))
        .sum();
    let w2 = w * w;
    let m2 = sum_sq / nf;
    let m4 = dev.iter().map(|d| d.powi(4)).sum::<f64>() / nf;
    let b2 = m4 / (m2 * m2);

    let t1 = nf * ((nf * nf - 3.0 * nf + 3.0) * s1 - nf * s2 + 3.0 * w2);
    let t2 = b2 * ((nf * nf - nf) * s1 - 2.0 * nf * s2 + 6.0 * w2);
    let variance = (t1 - t2) / ((nf - 1.0) * (nf - 2.0) * (nf - 3.0) * w2) - expected * expected;

    let z_score = if variance > 0.0 {
        (statistic - expected) / variance.sqrt()
    } else {
        0.0
    };

    Ok(MoransI {
        statistic,
        expected,
        variance,
        z_score,
        p_value: Normal::two_sided_p(z_score),
    })
}

/// One channel's autocorrelation in one specimen.
#[derive(Debug, Clone, PartialEq)]
pub struct AutocorrelationRecord {
    pub channel: String,
    pub value: f64,
    pub cells: usize,
}

/// Moran's I of every channel's positivity, pooled over manifests.
///
/// Channels for which no manifest yields a value are omitted.
pub fn compute_autocorrelation(
    matrix: &FeatureMatrix,
    radius: f64,
    builder: &dyn IndexBuilder,
) -> Vec<AutocorrelationRecord> {
    let channels = matrix.channels();
    // Per channel: Σ cells·I and Σ cells.
    let mut pooled = vec![(0.0_f64, 0usize); channels.len()];

    for (manifest, rows) in matrix.manifest_partitions() {
        let points: Vec<Point> = rows.iter().map(|&r| matrix.points()[r]).collect();
        let graph = SpatialGraph::within_radius(&points, radius, builder);
        debug!(
            specimen = matrix.specimen(),
            manifest = %manifest,
            cells = points.len(),
            edges = graph.total_weight() / 2,
            "radius graph"
        );

        for (bit, channel) in channels.channels().iter().enumerate() {
            let values: Vec<f64> = rows
                .iter()
                .map(|&r| ((matrix.expressions()[r] >> bit) & 1) as f64)
                .collect();
            match morans_i(&values, &graph) {
                Ok(m) => {
                    pooled[bit].0 += m.statistic * rows.len() as f64;
                    pooled[bit].1 += rows.len();
                }
                Err(e) if e.is_recoverable() => info!(
                    specimen = matrix.specimen(),
                    manifest = %manifest,
                    channel = %channel.symbol,
                    "no autocorrelation value: {}",
                    e
                ),
                Err(e) => error!(
                    specimen = matrix.specimen(),
                    manifest = %manifest,
                    channel = %channel.symbol,
                    "autocorrelation failed: {}",
                    e
                ),
            }
        }
    }

    channels
        .channels()
        .iter()
        .zip(pooled)
        .filter(|(_, (_, cells))| *cells > 0)
        .map(|(channel, (sum, cells))| AutocorrelationRecord {
            channel: channel.symbol.clone(),
            value: sum / cells as f64,
            cells,
        })
        .collect()
}

pub fn to_feature_batch(specimen: &str, records: &[AutocorrelationRecord]) -> FeatureBatch {
    let mut batch = FeatureBatch::new(DerivationMethod::SpatialAutocorrelation, specimen);
    for r in records {
        batch.push(vec![r.channel.clone()], r.value);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BruteForceBuilder, KdTreeBuilder};
    use crate::matrix::fixtures::matrix;

    const TOL: f64 = 1e-10;

    fn line(n: usize) -> Vec<Point> {
        (0..n).map(|i| Point::new(10.0 * i as f64, 0.0)).collect()
    }

    #[test]
    fn path_graph_neighbors() {
        let g = SpatialGraph::within_radius(&line(4), 10.0, &KdTreeBuilder);
        assert_eq!(g.neighbors(0), &[1]);
        assert_eq!(g.neighbors(1), &[0, 2]);
        assert_eq!(g.total_weight(), 6);
    }

    #[test]
    fn clustered_values_are_positive() {
        // Path 0-1-2-3 with values 1,1,0,0: I = (4/6)·0.5/1 = 1/3.
        let g = SpatialGraph::within_radius(&line(4), 10.0, &BruteForceBuilder);
        let m = morans_i(&[1.0, 1.0, 0.0, 0.0], &g).unwrap();
        assert!((m.statistic - 1.0 / 3.0).abs() < TOL, "I={}", m.statistic);
        assert!((m.expected + 1.0 / 3.0).abs() < TOL);
        assert!(m.p_value > 0.0 && m.p_value <= 1.0);
    }

    #[test]
    fn alternating_values_are_negative() {
        let g = SpatialGraph::within_radius(&line(4), 10.0, &KdTreeBuilder);
        let m = morans_i(&[1.0, 0.0, 1.0, 0.0], &g).unwrap();
        // Every edge joins unlike values: I = (4/6)·(-1.5)/1 = -1.
        assert!((m.statistic + 1.0).abs() < TOL, "I={}", m.statistic);
    }

    #[test]
    fn degenerate_inputs() {
        let g = SpatialGraph::within_radius(&line(4), 10.0, &KdTreeBuilder);
        assert!(matches!(
            morans_i(&[1.0; 4], &g),
            Err(TesseraError::NumericInstability(_))
        ));
        let sparse = SpatialGraph::within_radius(&line(4), 5.0, &KdTreeBuilder);
        assert!(matches!(
            morans_i(&[1.0, 0.0, 1.0, 0.0], &sparse),
            Err(TesseraError::DegenerateInput(_))
        ));
        let small = SpatialGraph::within_radius(&line(3), 10.0, &KdTreeBuilder);
        assert!(matches!(
            morans_i(&[1.0, 0.0, 1.0], &small),
            Err(TesseraError::DegenerateInput(_))
        ));
        assert!(morans_i(&[1.0], &g).is_err());
    }

    #[test]
    fn pooled_over_manifests_by_cell_count() {
        let m = matrix(
            &["A", "B"],
            &[
                (0.0, 0.0, "A", None, "m1"),
                (10.0, 0.0, "A", None, "m1"),
                (20.0, 0.0, "", None, "m1"),
                (30.0, 0.0, "", None, "m1"),
                (0.0, 0.0, "A", None, "m2"),
                (10.0, 0.0, "", None, "m2"),
                (20.0, 0.0, "A", None, "m2"),
                (30.0, 0.0, "", None, "m2"),
            ],
        );
        let records = compute_autocorrelation(&m, 10.0, &KdTreeBuilder);
        // B is never positive: constant, no value.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel, "A");
        assert_eq!(records[0].cells, 8);
        let expected = (4.0 * (1.0 / 3.0) + 4.0 * -1.0) / 8.0;
        assert!((records[0].value - expected).abs() < TOL, "I={}", records[0].value);

        let batch = to_feature_batch("s", &records);
        assert_eq!(batch.derivation_method, DerivationMethod::SpatialAutocorrelation);
        assert_eq!(batch.values[0].specifiers, vec!["A"]);
    }
}
