//! Deterministic ranking for evaluated candidates.
//!
//! The evaluator score dominates; the historical prior orders equally-scored
//! candidates; creation order breaks any remaining tie so a run is fully
//! reproducible given the same inputs.

/// Ranking key for one evaluated candidate at a depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey {
    /// Evaluator score in `[0, 1]`.
    pub score: f64,
    /// Historical prior (mean score over matching contexts), tie-break only.
    pub prior: f64,
    /// Creation order within the depth, stable across runs.
    pub seq: usize,
}

/// Return candidate indices ordered by score desc, prior desc, seq asc.
pub fn ranked_order(keys: &[RankKey]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| {
        keys[b]
            .score
            .total_cmp(&keys[a].score)
            .then(keys[b].prior.total_cmp(&keys[a].prior))
            .then(keys[a].seq.cmp(&keys[b].seq))
    });
    order
}

/// Keep at most `width` leading entries of a ranked ordering.
pub fn prune_to_width(mut order: Vec<usize>, width: usize) -> Vec<usize> {
    order.truncate(width);
    order
}
