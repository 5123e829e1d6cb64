//! Phenotype proximity metrics.
//!
//! For source phenotype A, target phenotype B, compartment κ and radius r the
//! unbalanced metric is the mean number of B-typed neighbors (other than the
//! cell itself) within r of an A-typed cell, both restricted to κ. The
//! balanced metric divides the same pair count by the area of κ instead of
//! the source count. Specimens with several cell manifests are computed per
//! manifest and pooled by summing counts and denominators.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::features::{DerivationMethod, FeatureBatch};
use crate::index::IndexBuilder;
use crate::matrix::{Compartment, FeatureMatrix};
use crate::shape::Point;
use crate::signature::PhenotypeSignature;

pub const DEFAULT_RADIUS_LOW: f64 = 10.0;
pub const DEFAULT_RADIUS_HIGH: f64 = 100.0;
pub const DEFAULT_RADIUS_STEPS: u32 = 4;

/// `r_i = round(r_lo * (r_hi / r_lo)^(i / k))` for `i = 0..=k`, deduplicated.
pub fn log_spaced_radii(r_lo: f64, r_hi: f64, k: u32) -> Vec<u32> {
    let mut radii: Vec<u32> = if k == 0 {
        vec![r_lo.round() as u32]
    } else {
        (0..=k)
            .map(|i| (r_lo * (r_hi / r_lo).powf(i as f64 / k as f64)).round() as u32)
            .collect()
    };
    radii.sort_unstable();
    radii.dedup();
    radii
}

/// Calculator parameters.
#[derive(Debug, Clone)]
pub struct ProximityConfig {
    /// Radii in pixels.
    pub radii: Vec<u32>,
    pub balanced: bool,
    /// Named compartments to evaluate besides "all"; `None` means every
    /// compartment present in the specimen.
    pub compartments: Option<Vec<String>>,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            radii: log_spaced_radii(DEFAULT_RADIUS_LOW, DEFAULT_RADIUS_HIGH, DEFAULT_RADIUS_STEPS),
            balanced: false,
            compartments: None,
        }
    }
}

/// Area of a compartment within a set of cells, used as the balanced-mode
/// denominator.
pub trait RegionalAreas: Send + Sync {
    fn area(&self, matrix: &FeatureMatrix, rows: &[usize], compartment: &Compartment) -> Option<f64>;
}

/// Sums the polygon areas of the cells in the compartment.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellAreaSum;

impl RegionalAreas for CellAreaSum {
    fn area(&self, matrix: &FeatureMatrix, rows: &[usize], compartment: &Compartment) -> Option<f64> {
        let total: f64 = rows
            .iter()
            .filter(|&&r| compartment.contains(matrix.compartment(r)))
            .map(|&r| matrix.areas()[r])
            .sum();
        Some(total)
    }
}

/// One proximity metric of one specimen.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityRecord {
    pub source: String,
    pub target: String,
    pub compartment: String,
    pub radius: u32,
    pub value: f64,
    /// A-typed cells in κ, summed over manifests.
    pub source_count: usize,
    /// Neighbor pairs after self-pair subtraction, summed over manifests.
    pub pair_count: f64,
    /// Balanced mode denominator.
    pub area: Option<f64>,
}

impl ProximityRecord {
    /// `(source, target, radius)`.
    pub fn specifiers(&self) -> Vec<String> {
        vec![self.source.clone(), self.target.clone(), self.radius.to_string()]
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    pairs: f64,
    sources: usize,
    area: f64,
}

/// Compute every metric for one specimen.
///
/// Output is sorted by (source, target, compartment, radius). Metrics with
/// no source cells (or, balanced, no area) are absent.
pub fn compute_proximity(
    matrix: &FeatureMatrix,
    phenotypes: &[PhenotypeSignature],
    config: &ProximityConfig,
    builder: &dyn IndexBuilder,
    areas: &dyn RegionalAreas,
) -> Vec<ProximityRecord> {
    let mut radii = config.radii.clone();
    radii.sort_unstable();
    radii.dedup();
    let Some(&r_max) = radii.last() else {
        return Vec::new();
    };

    let mut compartments = vec![Compartment::All];
    let names = config
        .compartments
        .clone()
        .unwrap_or_else(|| matrix.compartment_names());
    compartments.extend(names.into_iter().map(Compartment::Named));

    let pairs: Vec<(usize, usize)> = if config.balanced {
        let mut pairs = Vec::new();
        for a in 0..phenotypes.len() {
            for b in 0..phenotypes.len() {
                if phenotypes[a].name < phenotypes[b].name {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    } else {
        (0..phenotypes.len())
            .flat_map(|a| (0..phenotypes.len()).map(move |b| (a, b)))
            .collect()
    };

    // (source, target, compartment, radius) -> tallies pooled across manifests.
    let mut tallies: BTreeMap<(usize, usize, usize, usize), Tally> = BTreeMap::new();

    for (manifest, rows) in matrix.manifest_partitions() {
        let points: Vec<Point> = rows.iter().map(|&r| matrix.points()[r]).collect();
        let index = builder.build(&points);
        let masks: Vec<Vec<bool>> = phenotypes
            .iter()
            .map(|p| matrix.phenotype_mask(&rows, &p.signature))
            .collect();

        for (k, compartment) in compartments.iter().enumerate() {
            let in_k = matrix.compartment_mask(&rows, compartment);
            if !in_k.iter().any(|&b| b) {
                debug!(manifest = %manifest, compartment = %compartment, "no cells in compartment");
                continue;
            }
            let area = if config.balanced {
                areas.area(matrix, &rows, compartment).unwrap_or(0.0)
            } else {
                0.0
            };

            let mut sources_by_a: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for &(a, _) in &pairs {
                sources_by_a.entry(a).or_insert_with(|| {
                    (0..rows.len()).filter(|&i| masks[a][i] && in_k[i]).collect()
                });
            }

            for (&a, sources) in &sources_by_a {
                let targets: Vec<usize> = pairs.iter().filter(|p| p.0 == a).map(|p| p.1).collect();
                let query: Vec<Point> = sources.iter().map(|&i| points[i]).collect();
                let neighborhoods = index.within_radius(&query, r_max as f64);

                // hist[t][r]: neighbors of target t first reached at radius r.
                let mut hist = vec![vec![0.0_f64; radii.len()]; targets.len()];
                for (s, hood) in sources.iter().zip(&neighborhoods) {
                    for &j in hood {
                        if !in_k[j] {
                            continue;
                        }
                        let d2 = points[*s].distance_squared(&points[j]);
                        let Some(bucket) = radii.iter().position(|&r| d2 <= f64::from(r) * f64::from(r)) else {
                            continue;
                        };
                        for (t, &b) in targets.iter().enumerate() {
                            if masks[b][j] {
                                hist[t][bucket] += 1.0;
                            }
                        }
                    }
                }

                for (t, &b) in targets.iter().enumerate() {
                    // Each source that is also B counted itself at distance 0.
                    let self_pairs = sources.iter().filter(|&&i| masks[b][i]).count() as f64;
                    let mut cumulative = 0.0;
                    for (ri, &count) in hist[t].iter().enumerate() {
                        cumulative += count;
                        let tally = tallies.entry((a, b, k, ri)).or_default();
                        tally.pairs += cumulative - self_pairs;
                        tally.sources += sources.len();
                        tally.area += area;
                    }
                }
            }
        }
    }

    let mut records = Vec::new();
    for (&(a, b, k, ri), tally) in &tallies {
        let (value, area) = if config.balanced {
            if tally.area > 0.0 {
                (tally.pairs / tally.area, Some(tally.area))
            } else {
                info!(
                    specimen = matrix.specimen(),
                    compartment = compartments[k].label(),
                    "zero compartment area, balanced metric absent"
                );
                continue;
            }
        } else if tally.sources > 0 {
            (tally.pairs / tally.sources as f64, None)
        } else {
            continue;
        };
        records.push(ProximityRecord {
            source: phenotypes[a].name.clone(),
            target: phenotypes[b].name.clone(),
            compartment: compartments[k].label().to_string(),
            radius: radii[ri],
            value,
            source_count: tally.sources,
            pair_count: tally.pairs,
            area,
        });
    }

    if !config.balanced {
        let absent: Vec<&str> = phenotypes
            .iter()
            .filter(|p| !records.iter().any(|r| r.source == p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !absent.is_empty() {
            info!(
                specimen = matrix.specimen(),
                phenotypes = %absent.join(", "),
                "no source cells, proximity absent"
            );
        }
    }

    sort_records(&mut records);
    records
}

/// Sort by (source, target, compartment, radius).
pub fn sort_records(records: &mut [ProximityRecord]) {
    records.sort_by(|x, y| {
        (&x.source, &x.target, &x.compartment, x.radius).cmp(&(
            &y.source,
            &y.target,
            &y.compartment,
            y.radius,
        ))
    });
}

/// Feature values for upload: the "all" compartment only.
pub fn to_feature_batch(specimen: &str, records: &[ProximityRecord], balanced: bool) -> FeatureBatch {
    let method = if balanced {
        DerivationMethod::BalancedProximity
    } else {
        DerivationMethod::Proximity
    };
    let mut batch = FeatureBatch::new(method, specimen);
    for r in records.iter().filter(|r| r.compartment == Compartment::All.label()) {
        batch.push(r.specifiers(), r.value);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BruteForceBuilder, KdTreeBuilder};
    use crate::matrix::fixtures::{matrix, phenotype};

    const TOL: f64 = 1e-12;

    fn config(radii: &[u32]) -> ProximityConfig {
        ProximityConfig {
            radii: radii.to_vec(),
            balanced: false,
            compartments: None,
        }
    }

    fn find<'a>(records: &'a [ProximityRecord], s: &str, t: &str, k: &str, r: u32) -> Option<&'a ProximityRecord> {
        records
            .iter()
            .find(|x| x.source == s && x.target == t && x.compartment == k && x.radius == r)
    }

    #[test]
    fn default_radii_are_log_spaced() {
        assert_eq!(ProximityConfig::default().radii, vec![10, 18, 32, 56, 100]);
        assert_eq!(log_spaced_radii(10.0, 10.0, 3), vec![10]);
    }

    #[test]
    fn same_phenotype_column() {
        let m = matrix(
            &["X"],
            &[
                (0.0, 0.0, "X", None, "m"),
                (0.0, 10.0, "X", None, "m"),
                (0.0, 20.0, "X", None, "m"),
                (0.0, 30.0, "X", None, "m"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let records = compute_proximity(&m, &[x], &config(&[15]), &KdTreeBuilder, &CellAreaSum);
        let r = find(&records, "X", "X", "all", 15).unwrap();
        assert!((r.value - 1.5).abs() < TOL);
        assert_eq!(r.source_count, 4);
    }

    #[test]
    fn distinct_target_phenotype() {
        let m = matrix(
            &["X", "Y"],
            &[
                (0.0, 0.0, "X", None, "m"),
                (0.0, 10.0, "X", None, "m"),
                (0.0, 20.0, "X", None, "m"),
                (0.0, 30.0, "Y", None, "m"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let y = phenotype(&m, "Y", "Y");
        let records = compute_proximity(&m, &[x, y], &config(&[15]), &BruteForceBuilder, &CellAreaSum);
        let r = find(&records, "X", "Y", "all", 15).unwrap();
        assert!((r.value - 1.0 / 3.0).abs() < TOL);
        let r = find(&records, "Y", "X", "all", 15).unwrap();
        assert!((r.value - 1.0).abs() < TOL);
    }

    #[test]
    fn radii_are_cumulative() {
        let m = matrix(
            &["X"],
            &[
                (0.0, 0.0, "X", None, "m"),
                (0.0, 10.0, "X", None, "m"),
                (0.0, 20.0, "X", None, "m"),
                (0.0, 30.0, "X", None, "m"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let records = compute_proximity(&m, &[x], &config(&[5, 15, 35]), &KdTreeBuilder, &CellAreaSum);
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0.0, 1.5, 3.0]);
    }

    #[test]
    fn compartments_restrict_both_ends() {
        let m = matrix(
            &["X"],
            &[
                (0.0, 0.0, "X", Some("Tumor"), "m"),
                (0.0, 10.0, "X", Some("Stroma"), "m"),
                (0.0, 20.0, "X", Some("Tumor"), "m"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let records = compute_proximity(&m, &[x], &config(&[10, 20]), &KdTreeBuilder, &CellAreaSum);
        assert!((find(&records, "X", "X", "Tumor", 10).unwrap().value).abs() < TOL);
        assert!((find(&records, "X", "X", "Tumor", 20).unwrap().value - 1.0).abs() < TOL);
        assert!((find(&records, "X", "X", "Stroma", 20).unwrap().value).abs() < TOL);
        assert!((find(&records, "X", "X", "all", 10).unwrap().value - 4.0 / 3.0).abs() < TOL);
    }

    #[test]
    fn missing_compartment_and_sources_are_absent() {
        let m = matrix(
            &["X", "Y"],
            &[(0.0, 0.0, "X", Some("Tumor"), "m"), (0.0, 5.0, "X", Some("Tumor"), "m")],
        );
        let x = phenotype(&m, "X", "X");
        let y = phenotype(&m, "Y", "Y");
        let cfg = ProximityConfig {
            compartments: Some(vec!["Tumor".into(), "Necrosis".into()]),
            ..config(&[10])
        };
        let records = compute_proximity(&m, &[x, y], &cfg, &KdTreeBuilder, &CellAreaSum);
        assert!(records.iter().all(|r| r.compartment != "Necrosis"));
        assert!(records.iter().all(|r| r.source != "Y"));
        assert!((find(&records, "X", "Y", "Tumor", 10).unwrap().value).abs() < TOL);
    }

    #[test]
    fn manifests_pool_by_source_count() {
        // Manifest a: X at 0,0 and 0,5 (1 neighbor each); b: one lone X far
        // away in its own coordinate frame, overlapping a's coordinates.
        let m = matrix(
            &["X"],
            &[
                (0.0, 0.0, "X", None, "a"),
                (0.0, 5.0, "X", None, "a"),
                (0.0, 1.0, "X", None, "b"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let records = compute_proximity(&m, &[x], &config(&[10]), &KdTreeBuilder, &CellAreaSum);
        let r = find(&records, "X", "X", "all", 10).unwrap();
        assert_eq!(r.source_count, 3);
        assert!((r.value - 2.0 / 3.0).abs() < TOL);
    }

    #[test]
    fn balanced_mode_uses_area_and_canonical_pairs() {
        let m = matrix(
            &["X", "Y"],
            &[
                (0.0, 0.0, "X", None, "m"),
                (0.0, 5.0, "Y", None, "m"),
                (0.0, 8.0, "X Y", None, "m"),
                (50.0, 50.0, "Y", None, "m"),
            ],
        );
        let x = phenotype(&m, "X", "X");
        let y = phenotype(&m, "Y", "Y");
        let cfg = ProximityConfig {
            balanced: true,
            ..config(&[10])
        };
        let records = compute_proximity(&m, &[y.clone(), x.clone()], &cfg, &KdTreeBuilder, &CellAreaSum);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!((r.source.as_str(), r.target.as_str()), ("X", "Y"));
        // X cells 0 and 2 see Y cells {1, 2} and {1, 2}: 4, minus self-pair of cell 2.
        assert!((r.pair_count - 3.0).abs() < TOL);
        assert_eq!(r.area, Some(4.0));
        assert!((r.value - 0.75).abs() < TOL);
    }

    #[test]
    fn deterministic_and_index_independent() {
        let cells: Vec<(f64, f64, &str, Option<&str>, &str)> = (0..60)
            .map(|i| {
                let x = ((i * 37) % 101) as f64;
                let y = ((i * 53) % 97) as f64;
                let p = if i % 3 == 0 { "X" } else if i % 3 == 1 { "Y" } else { "X Y" };
                let k = if i % 2 == 0 { Some("Tumor") } else { Some("Stroma") };
                (x, y, p, k, "m")
            })
            .collect();
        let m = matrix(&["X", "Y"], &cells);
        let phenos = [phenotype(&m, "X", "X"), phenotype(&m, "Y", "Y")];
        let cfg = ProximityConfig::default();
        let a = compute_proximity(&m, &phenos, &cfg, &KdTreeBuilder, &CellAreaSum);
        let b = compute_proximity(&m, &phenos, &cfg, &KdTreeBuilder, &CellAreaSum);
        let c = compute_proximity(&m, &phenos, &cfg, &BruteForceBuilder, &CellAreaSum);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 2 * 2 * 3 * 5);
    }

    #[test]
    fn batch_keeps_all_compartment() {
        let m = matrix(
            &["X"],
            &[(0.0, 0.0, "X", Some("Tumor"), "m"), (0.0, 5.0, "X", Some("Tumor"), "m")],
        );
        let x = phenotype(&m, "X", "X");
        let records = compute_proximity(&m, &[x], &config(&[10]), &KdTreeBuilder, &CellAreaSum);
        assert_eq!(records.len(), 2);
        let batch = to_feature_batch("s1", &records, false);
        assert_eq!(batch.derivation_method, DerivationMethod::Proximity);
        assert_eq!(batch.values.len(), 1);
        assert_eq!(batch.values[0].specifiers, vec!["X", "X", "10"]);
    }
}
