//! Spatial indexes over cell centroids.
//!
//! Calculators depend only on the [`SpatialIndex`] trait; the k-d tree and the
//! brute-force scan are interchangeable implementations, chosen by passing an
//! [`IndexBuilder`].

use kiddo::{ImmutableKdTree, SquaredEuclidean};

use crate::shape::Point;

type Tree = ImmutableKdTree<f64, 2>;

/// Index and distance of a query's nearest centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

/// Immutable radius and nearest-neighbor queries over a fixed point set.
pub trait SpatialIndex: Send + Sync {
    /// Number of indexed points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// For each query, the ascending indices of points at distance ≤ `radius`.
    fn within_radius(&self, queries: &[Point], radius: f64) -> Vec<Vec<usize>>;

    /// For each query, the closest point among those with `subset[i]` set.
    /// `None` when the subset is empty.
    fn nearest(&self, queries: &[Point], subset: &[bool]) -> Vec<Option<Neighbor>>;
}

/// Factory for per-specimen indexes.
pub trait IndexBuilder: Send + Sync {
    fn build(&self, points: &[Point]) -> Box<dyn SpatialIndex>;
}

// ---------------------------------------------------------------------------
// k-d tree
// ---------------------------------------------------------------------------

/// Static k-d tree index. Repeated coordinates, including many cells stacked
/// on one pixel column, are accepted.
pub struct KdTreeIndex {
    points: Vec<Point>,
    tree: Option<Tree>,
}

impl KdTreeIndex {
    pub fn new(points: &[Point]) -> Self {
        Self {
            points: points.to_vec(),
            tree: build_tree(points.iter()),
        }
    }
}

/// Tree items are positions in the iteration order of `points`.
fn build_tree<'a>(points: impl Iterator<Item = &'a Point>) -> Option<Tree> {
    let coordinates: Vec<[f64; 2]> = points.map(|p| [p.x, p.y]).collect();
    if coordinates.is_empty() {
        return None;
    }
    Some(Tree::new_from_slice(&coordinates))
}

impl SpatialIndex for KdTreeIndex {
    fn len(&self) -> usize {
        self.points.len()
    }

    fn within_radius(&self, queries: &[Point], radius: f64) -> Vec<Vec<usize>> {
        let Some(tree) = &self.tree else {
            return vec![Vec::new(); queries.len()];
        };
        let r2 = radius * radius;
        // Widen the tree query slightly, then apply the exact inclusive test.
        let widened = r2 * (1.0 + 1e-9) + 1e-12;
        queries
            .iter()
            .map(|q| {
                let mut hits: Vec<usize> = tree
                    .within_unsorted::<SquaredEuclidean>(&[q.x, q.y], widened)
                    .into_iter()
                    .map(|n| n.item as usize)
                    .filter(|&i| self.points[i].distance_squared(q) <= r2)
                    .collect();
                hits.sort_unstable();
                hits
            })
            .collect()
    }

    fn nearest(&self, queries: &[Point], subset: &[bool]) -> Vec<Option<Neighbor>> {
        let members: Vec<usize> = (0..self.points.len()).filter(|&i| subset[i]).collect();
        let everything = members.len() == self.points.len();
        let sub_tree;
        let tree = match &self.tree {
            Some(tree) if everything => tree,
            _ => match build_tree(members.iter().map(|&i| &self.points[i])) {
                Some(tree) => {
                    sub_tree = tree;
                    &sub_tree
                }
                None => return vec![None; queries.len()],
            },
        };
        queries
            .iter()
            .map(|q| {
                let hit = tree.nearest_one::<SquaredEuclidean>(&[q.x, q.y]);
                let index = if everything { hit.item as usize } else { members[hit.item as usize] };
                Some(Neighbor {
                    index,
                    distance: hit.distance.sqrt(),
                })
            })
            .collect()
    }
}

/// Builds [`KdTreeIndex`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct KdTreeBuilder;

impl IndexBuilder for KdTreeBuilder {
    fn build(&self, points: &[Point]) -> Box<dyn SpatialIndex> {
        Box::new(KdTreeIndex::new(points))
    }
}

// ---------------------------------------------------------------------------
// Brute force
// ---------------------------------------------------------------------------

/// Exhaustive O(n) per query scan. Reference implementation for small inputs.
pub struct BruteForceIndex {
    points: Vec<Point>,
}

impl BruteForceIndex {
    pub fn new(points: &[Point]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }
}

impl SpatialIndex for BruteForceIndex {
    fn len(&self) -> usize {
        self.points.len()
    }

    fn within_radius(&self, queries: &[Point], radius: f64) -> Vec<Vec<usize>> {
        let r2 = radius * radius;
        queries
            .iter()
            .map(|q| {
                (0..self.points.len())
                    .filter(|&i| self.points[i].distance_squared(q) <= r2)
                    .collect()
            })
            .collect()
    }

    fn nearest(&self, queries: &[Point], subset: &[bool]) -> Vec<Option<Neighbor>> {
        queries
            .iter()
            .map(|q| {
                self.points
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| subset[*i])
                    .map(|(i, p)| (i, p.distance_squared(q)))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(index, d2)| Neighbor {
                        index,
                        distance: d2.sqrt(),
                    })
            })
            .collect()
    }
}

/// Builds [`BruteForceIndex`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceBuilder;

impl IndexBuilder for BruteForceBuilder {
    fn build(&self, points: &[Point]) -> Box<dyn SpatialIndex> {
        Box::new(BruteForceIndex::new(points))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn column() -> Vec<Point> {
        (0..4).map(|i| Point::new(0.0, 10.0 * i as f64)).collect()
    }

    /// Deterministic scatter without an RNG dependency.
    fn scatter(n: usize) -> Vec<Point> {
        let mut state = 0x2545F4914F6CDD1D_u64;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let x = (state % 10_000) as f64 / 10.0;
                let y = ((state >> 20) % 10_000) as f64 / 10.0;
                Point::new(x, y)
            })
            .collect()
    }

    #[test]
    fn radius_is_inclusive() {
        for builder in [&KdTreeBuilder as &dyn IndexBuilder, &BruteForceBuilder] {
            let index = builder.build(&column());
            let hits = index.within_radius(&[Point::new(0.0, 0.0)], 10.0);
            assert_eq!(hits, vec![vec![0, 1]]);
            let hits = index.within_radius(&column(), 15.0);
            assert_eq!(hits, vec![vec![0, 1], vec![0, 1, 2], vec![1, 2, 3], vec![2, 3]]);
        }
    }

    #[test]
    fn nearest_in_subset() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
            Point::new(15.0, 5.0),
        ];
        let subset = [true, true, true, false];
        for builder in [&KdTreeBuilder as &dyn IndexBuilder, &BruteForceBuilder] {
            let index = builder.build(&points);
            let hit = index.nearest(&[points[3]], &subset)[0].unwrap();
            assert!(hit.index == 1 || hit.index == 2);
            assert!((hit.distance - 50.0_f64.sqrt()).abs() < 1e-12);
            assert_eq!(index.nearest(&[points[3]], &[false; 4]), vec![None]);
        }
    }

    #[test]
    fn kd_tree_agrees_with_brute_force() {
        let points = scatter(2_000);
        let queries = &points[..200];
        let kd = KdTreeIndex::new(&points);
        let brute = BruteForceIndex::new(&points);
        for r in [5.0, 25.0, 60.0] {
            assert_eq!(kd.within_radius(queries, r), brute.within_radius(queries, r));
        }
        let subset: Vec<bool> = (0..points.len()).map(|i| i % 3 == 0).collect();
        let a = kd.nearest(queries, &subset);
        let b = brute.nearest(queries, &subset);
        for (x, y) in a.iter().zip(&b) {
            assert!((x.unwrap().distance - y.unwrap().distance).abs() < 1e-9);
        }
    }

    #[test]
    fn stacked_and_repeated_coordinates() {
        let column: Vec<Point> = (0..600).map(|i| Point::new(0.0, i as f64)).collect();
        let kd = KdTreeIndex::new(&column);
        let brute = BruteForceIndex::new(&column);
        let queries = [Point::new(0.0, 300.0), Point::new(3.0, 10.0)];
        assert_eq!(kd.within_radius(&queries, 4.0), brute.within_radius(&queries, 4.0));

        let stacked = vec![Point::new(5.0, 5.0); 600];
        let kd = KdTreeIndex::new(&stacked);
        let hits = kd.within_radius(&[Point::new(5.0, 5.0)], 0.0);
        assert_eq!(hits[0], (0..600).collect::<Vec<_>>());
        let subset: Vec<bool> = (0..600).map(|i| i >= 300).collect();
        let hit = kd.nearest(&[Point::new(6.0, 5.0)], &subset)[0].unwrap();
        assert!(hit.index >= 300);
        assert!((hit.distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_index() {
        let index = KdTreeIndex::new(&[]);
        assert!(index.is_empty());
        assert_eq!(index.within_radius(&[Point::new(1.0, 1.0)], 5.0), vec![Vec::<usize>::new()]);
        assert_eq!(index.nearest(&[Point::new(1.0, 1.0)], &[]), vec![None]);
    }
}
