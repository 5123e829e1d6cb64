//! Average ranks with tie-group bookkeeping for rank-based tests.

/// Ranks of a sample together with the sizes of its tie groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    /// 1-based average rank of each input value, in input order.
    pub ranks: Vec<f64>,
    /// Size of every group of tied values (groups of size 1 included).
    pub tie_groups: Vec<usize>,
}

impl Ranking {
    /// Tie correction factor `1 - Σ(t³ - t) / (n³ - n)` used by Kruskal-Wallis.
    ///
    /// Returns 1.0 for fewer than two observations.
    pub fn tie_correction(&self) -> f64 {
        let n = self.ranks.len() as f64;
        if self.ranks.len() < 2 {
            return 1.0;
        }
        let ties: f64 = self
            .tie_groups
            .iter()
            .map(|&t| {
                let t = t as f64;
                t * t * t - t
            })
            .sum();
        1.0 - ties / (n * n * n - n)
    }
}

/// Assign average ranks to `data`; tied values share the mean of their
/// would-be ranks.
pub fn average_ranks(data: &[f64]) -> Ranking {
    let n = data.len();
    let mut indexed: Vec<(f64, usize)> = data.iter().copied().enumerate().map(|(i, v)| (v, i)).collect();
    indexed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut ranks = vec![0.0; n];
    let mut tie_groups = Vec::new();
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && indexed[j].0.total_cmp(&indexed[i].0).is_eq() {
            j += 1;
        }
        // Ranks i+1..=j averaged.
        let rank_val = (i + 1 + j) as f64 / 2.0;
        for &(_, orig_idx) in &indexed[i..j] {
            ranks[orig_idx] = rank_val;
        }
        tie_groups.push(j - i);
        i = j;
    }

    Ranking { ranks, tie_groups }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ties() {
        let r = average_ranks(&[3.0, 1.0, 2.0]);
        assert_eq!(r.ranks, vec![3.0, 1.0, 2.0]);
        assert_eq!(r.tie_groups, vec![1, 1, 1]);
        assert!((r.tie_correction() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn with_ties() {
        let r = average_ranks(&[1.0, 2.0, 2.0, 3.0]);
        assert_eq!(r.ranks, vec![1.0, 2.5, 2.5, 4.0]);
        assert_eq!(r.tie_groups, vec![1, 2, 1]);
        // 1 - 6 / 60
        assert!((r.tie_correction() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn all_equal() {
        let r = average_ranks(&[5.0, 5.0, 5.0]);
        assert_eq!(r.ranks, vec![2.0, 2.0, 2.0]);
        assert!(r.tie_correction().abs() < 1e-12);
    }

    #[test]
    fn empty() {
        let r = average_ranks(&[]);
        assert!(r.ranks.is_empty());
        assert!((r.tie_correction() - 1.0).abs() < 1e-12);
    }
}
