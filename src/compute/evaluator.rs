//! Task Evaluators
//!
//! An evaluator consumes one dequeued task: it visits every (query point,
//! reference point) pair the task covers and folds the contribution into the
//! query table's per-point accumulators. Contributions must be additive,
//! because a query subtree meets its reference subtrees one task at a time,
//! possibly on different ranks.

use crate::table::subtable::Subtable;
use crate::table::types::Metric;

/// The per-task computation seam.
pub trait TaskEvaluator: Send + Sync {
    fn evaluate(&self, metric: &dyn Metric, query: &Subtable, reference: &Subtable);
}

/// Gaussian kernel density contribution: each query point accumulates
/// `sum_r exp(-d^2(q, r) / (2 h^2))` over the task's reference points.
pub struct KernelSumEvaluator {
    bandwidth: f64,
}

impl KernelSumEvaluator {
    pub fn new(bandwidth: f64) -> Self {
        assert!(bandwidth > 0.0, "kernel bandwidth must be positive");
        Self { bandwidth }
    }
}

impl TaskEvaluator for KernelSumEvaluator {
    fn evaluate(&self, metric: &dyn Metric, query: &Subtable, reference: &Subtable) {
        let normalizer = 2.0 * self.bandwidth * self.bandwidth;
        let query_table = query.table();
        let reference_table = reference.table();
        for query_index in query.begin()..query.begin() + query.count() {
            let query_point = query_table.point(query_index);
            let mut sum = 0.0;
            for reference_index in reference.begin()..reference.begin() + reference.count() {
                let distance_sq =
                    metric.distance_sq(query_point, reference_table.point(reference_index));
                sum += (-distance_sq / normalizer).exp();
            }
            query_table.accumulate(query_index, sum);
        }
    }
}
