//! Computation Module Tests

#[cfg(test)]
mod tests {
    use crate::compute::evaluator::{KernelSumEvaluator, TaskEvaluator};
    use crate::table::subtable::{Subtable, Table};
    use crate::table::tree::ROOT;
    use crate::table::types::EuclideanMetric;

    #[test]
    fn test_kernel_sum_matches_direct_evaluation() {
        let query = Table::new(0, 1, vec![0.0, 1.0], 2);
        let reference = Table::new(0, 1, vec![0.0, 2.0], 2);
        let evaluator = KernelSumEvaluator::new(1.0);

        evaluator.evaluate(
            &EuclideanMetric,
            &Subtable::alias(query.clone(), ROOT),
            &Subtable::alias(reference, ROOT),
        );

        let results = query.results_range(0, 2);
        let expected_q0 = 1.0 + (-4.0_f64 / 2.0).exp();
        let expected_q1 = (-0.5_f64).exp() + (-0.5_f64).exp();
        assert!((results[0] - expected_q0).abs() < 1e-12);
        assert!((results[1] - expected_q1).abs() < 1e-12);
    }

    #[test]
    fn test_contributions_accumulate_across_tasks() {
        let query = Table::new(0, 1, vec![0.0], 1);
        let reference = Table::new(0, 1, vec![1.0, 3.0], 1);
        let evaluator = KernelSumEvaluator::new(2.0);
        let query_view = Subtable::alias(query.clone(), ROOT);

        // The two reference leaves arrive as separate tasks.
        let tree = reference.tree();
        let root = tree.node(ROOT);
        let left = Subtable::alias(reference.clone(), root.left.unwrap());
        let right = Subtable::alias(reference.clone(), root.right.unwrap());
        evaluator.evaluate(&EuclideanMetric, &query_view, &left);
        evaluator.evaluate(&EuclideanMetric, &query_view, &right);

        let whole = query.results_range(0, 1)[0];
        let expected = (-1.0_f64 / 8.0).exp() + (-9.0_f64 / 8.0).exp();
        assert!((whole - expected).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn test_zero_bandwidth_is_rejected() {
        KernelSumEvaluator::new(0.0);
    }
}
