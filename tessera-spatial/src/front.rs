//! Distance from cells of one compartment to the front of another.
//!
//! The front of compartment κ' is approximated by the centroids of its cells;
//! a cell's distance to the front is its distance to the nearest κ' cell.
//! Compartments with fewer than [`MIN_FRONT_CELLS`] cells have no front.

use std::collections::BTreeMap;

use tracing::info;

use tessera_stats::describe;

use crate::features::{DerivationMethod, FeatureBatch};
use crate::index::IndexBuilder;
use crate::matrix::FeatureMatrix;
use crate::shape::Point;
use crate::signature::PhenotypeSignature;

pub const MIN_FRONT_CELLS: usize = 3;

/// One cell's distance to the front of another compartment.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontDistance {
    pub structure: i64,
    pub phenotype: String,
    pub compartment: String,
    pub other_compartment: String,
    pub distance_to_front: f64,
}

/// Sample-level aggregate over cells matching (φ, κ, κ').
#[derive(Debug, Clone, PartialEq)]
pub struct FrontSummary {
    pub phenotype: String,
    pub compartment: String,
    pub other_compartment: String,
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub variance: f64,
}

impl FrontSummary {
    /// `(phenotype, compartment, other compartment)`.
    pub fn specifiers(&self) -> Vec<String> {
        vec![
            self.phenotype.clone(),
            self.compartment.clone(),
            self.other_compartment.clone(),
        ]
    }
}

/// Per-cell front distances for every ordered pair of distinct compartments.
///
/// `compartments` restricts the evaluated compartments; `None` uses every
/// compartment present. Manifests are processed separately.
pub fn compute_front_distances(
    matrix: &FeatureMatrix,
    phenotypes: &[PhenotypeSignature],
    compartments: Option<&[String]>,
    builder: &dyn IndexBuilder,
) -> Vec<FrontDistance> {
    let names = match compartments {
        Some(c) => c.to_vec(),
        None => matrix.compartment_names(),
    };
    let mut records = Vec::new();

    for (manifest, rows) in matrix.manifest_partitions() {
        let points: Vec<Point> = rows.iter().map(|&r| matrix.points()[r]).collect();
        let members: Vec<Vec<bool>> = names
            .iter()
            .map(|name| rows.iter().map(|&r| matrix.compartment(r) == Some(name.as_str())).collect())
            .collect();
        let index = builder.build(&points);

        for (front, front_mask) in names.iter().zip(&members) {
            let front_size = front_mask.iter().filter(|&&b| b).count();
            if front_size < MIN_FRONT_CELLS {
                info!(
                    specimen = matrix.specimen(),
                    manifest = %manifest,
                    compartment = %front,
                    cells = front_size,
                    "too few cells to define a front"
                );
                continue;
            }

            for (name, mask) in names.iter().zip(&members) {
                if name == front {
                    continue;
                }
                // Cells of the front itself never get a record.
                let cells: Vec<usize> = (0..rows.len()).filter(|&i| mask[i] && !front_mask[i]).collect();
                if cells.is_empty() {
                    continue;
                }
                let query: Vec<Point> = cells.iter().map(|&i| points[i]).collect();
                let nearest = index.nearest(&query, front_mask);

                for p in phenotypes {
                    for (&i, hit) in cells.iter().zip(&nearest) {
                        let Some(hit) = hit else { continue };
                        if !p.signature.matches(matrix.expressions()[rows[i]]) {
                            continue;
                        }
                        records.push(FrontDistance {
                            structure: matrix.structure_ids()[rows[i]],
                            phenotype: p.name.clone(),
                            compartment: name.clone(),
                            other_compartment: front.clone(),
                            distance_to_front: hit.distance,
                        });
                    }
                }
            }
        }
    }

    records.sort_by(|a, b| {
        (&a.phenotype, &a.compartment, &a.other_compartment, a.structure).cmp(&(
            &b.phenotype,
            &b.compartment,
            &b.other_compartment,
            b.structure,
        ))
    });
    records
}

/// Count, mean, median and population variance per (φ, κ, κ').
pub fn summarize_front_distances(records: &[FrontDistance]) -> Vec<FrontSummary> {
    let mut groups: BTreeMap<(&str, &str, &str), Vec<f64>> = BTreeMap::new();
    for r in records {
        groups
            .entry((&r.phenotype, &r.compartment, &r.other_compartment))
            .or_default()
            .push(r.distance_to_front);
    }
    groups
        .into_iter()
        .filter_map(|((phenotype, compartment, other), distances)| {
            let stats = describe(&distances).ok()?;
            Some(FrontSummary {
                phenotype: phenotype.to_string(),
                compartment: compartment.to_string(),
                other_compartment: other.to_string(),
                count: stats.count,
                mean: stats.mean,
                median: stats.median,
                variance: stats.variance,
            })
        })
        .collect()
}

/// Feature values for upload: the mean distance per (φ, κ, κ').
pub fn to_feature_batch(specimen: &str, summaries: &[FrontSummary]) -> FeatureBatch {
    let mut batch = FeatureBatch::new(DerivationMethod::FrontProximity, specimen);
    for s in summaries {
        batch.push(s.specifiers(), s.mean);
    }
    batch
}
