//! World Module Tests
//!
//! Covers mailbox registration, encode/decode round trips through the
//! router, and the topology helpers consumed by the queue.

#[cfg(test)]
mod tests {
    use crate::world::router::{Router, World};
    use crate::world::types::ShardCounts;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Probe {
        Ping(u64),
        Data(Vec<f64>),
    }

    fn two_rank_world() -> (std::sync::Arc<World>, std::sync::Arc<World>) {
        let router = Router::new();
        let counts = vec![
            ShardCounts { queries: 2, references: 3 },
            ShardCounts { queries: 5, references: 7 },
        ];
        let w0 = World::join(router.clone(), 0, counts.clone());
        let w1 = World::join(router, 1, counts);
        (w0, w1)
    }

    #[test]
    fn test_send_and_drain_roundtrip() {
        let (w0, w1) = two_rank_world();

        w0.send(1, &Probe::Ping(42)).unwrap();
        w0.send(1, &Probe::Data(vec![1.5, -2.5])).unwrap();

        let received = w1.drain::<Probe>();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], (0, Probe::Ping(42)));
        assert_eq!(received[1], (0, Probe::Data(vec![1.5, -2.5])));

        // Mailbox is empty after a drain.
        assert!(w1.drain::<Probe>().is_empty());
    }

    #[test]
    fn test_self_send_loops_back() {
        let (w0, _w1) = two_rank_world();

        w0.send(0, &Probe::Ping(7)).unwrap();
        assert_eq!(w0.pending(), 1);

        let received = w0.drain::<Probe>();
        assert_eq!(received, vec![(0, Probe::Ping(7))]);
    }

    #[test]
    fn test_send_to_unregistered_rank_fails() {
        let (w0, _w1) = two_rank_world();
        assert!(w0.send(9, &Probe::Ping(0)).is_err());
    }

    #[test]
    fn test_topology_counts() {
        let (w0, w1) = two_rank_world();

        assert_eq!(w0.size(), 2);
        assert_eq!(w0.total_query_points(), 7);
        assert_eq!(w0.total_reference_points(), 10);
        assert_eq!(w1.query_count(0), 2);
        assert_eq!(w1.reference_count(1), 7);
    }

    #[test]
    fn test_process_distance_is_hypercube() {
        let router = Router::new();
        let counts = vec![ShardCounts { queries: 1, references: 1 }; 4];
        let w2 = World::join(router, 2, counts);

        assert_eq!(w2.process_distance(2), 0);
        assert_eq!(w2.process_distance(3), 1);
        assert_eq!(w2.process_distance(0), 1);
        assert_eq!(w2.process_distance(1), 2);
    }
}
