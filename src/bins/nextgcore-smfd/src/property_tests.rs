//! Property-Based Tests for the Session Core
//!
//! Path endpoints, pool exclusivity and round trips, pending-set
//! convergence and the rule lifecycle, checked with proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    use crate::context::{PendingOp, PfcpOutcome, SmContext};
    use crate::datapath::DataPath;
    use crate::pool::UeIpPool;
    use crate::rule::{Pdr, RuleTable};
    use crate::topology::tests::line_topology;
    use crate::topology::SNssai;

    // ========================================================================
    // Strategies for generating test data
    // ========================================================================

    #[derive(Debug, Clone)]
    enum PoolOp {
        AllocateStatic,
        AllocateDynamic,
        AllocatePreferred(u8),
        Release(usize),
    }

    fn arb_pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            Just(PoolOp::AllocateStatic),
            Just(PoolOp::AllocateDynamic),
            any::<u8>().prop_map(PoolOp::AllocatePreferred),
            any::<usize>().prop_map(PoolOp::Release),
        ]
    }

    #[derive(Debug, Clone)]
    enum RuleOp {
        Insert(u16),
        Update(u16),
        Remove(u16),
        Sync,
    }

    fn arb_rule_op() -> impl Strategy<Value = RuleOp> {
        prop_oneof![
            (1u16..8).prop_map(RuleOp::Insert),
            (1u16..8).prop_map(RuleOp::Update),
            (1u16..8).prop_map(RuleOp::Remove),
            Just(RuleOp::Sync),
        ]
    }

    /// Static /28 carved out of a dynamic /24
    fn pools() -> (UeIpPool, UeIpPool) {
        let dynamic = UeIpPool::new("10.60.0.0/24").unwrap();
        let fixed = UeIpPool::new("10.60.0.16/28").unwrap();
        dynamic.exclude(&fixed);
        (dynamic, fixed)
    }

    // ========================================================================
    // Data paths
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Exactly one head and one tail, the same node for a single hop
        #[test]
        fn prop_path_has_one_head_and_one_tail(len in 1usize..8) {
            let topology = line_topology();
            let upfs: Vec<_> = topology.upfs().cloned().collect();
            let hops: Vec<_> = (0..len).map(|i| upfs[i % upfs.len()].clone()).collect();

            let path = DataPath::generate(&hops).unwrap();
            let heads: Vec<usize> = (0..path.nodes.len()).filter(|&i| path.nodes[i].prev.is_none()).collect();
            let tails: Vec<usize> = (0..path.nodes.len()).filter(|&i| path.nodes[i].next.is_none()).collect();

            prop_assert_eq!(heads.len(), 1);
            prop_assert_eq!(tails.len(), 1);
            prop_assert_eq!(path.iter().count(), len);
            if len == 1 {
                prop_assert_eq!(heads[0], tails[0]);
            }
        }
    }

    // ========================================================================
    // Address pools
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// No address of the static range is ever free in both pools
        #[test]
        fn prop_static_and_dynamic_never_both_free(ops in prop::collection::vec(arb_pool_op(), 1..60)) {
            let (dynamic, fixed) = pools();
            let mut held: Vec<(Ipv4Addr, bool)> = Vec::new();

            for op in ops {
                match op {
                    PoolOp::AllocateStatic => {
                        if let Some(addr) = fixed.allocate(None) {
                            held.push((addr, true));
                        }
                    }
                    PoolOp::AllocateDynamic => {
                        if let Some(addr) = dynamic.allocate(None) {
                            held.push((addr, false));
                        }
                    }
                    PoolOp::AllocatePreferred(last) => {
                        let preferred = Ipv4Addr::new(10, 60, 0, last);
                        if let Some(addr) = dynamic.allocate(Some(preferred)) {
                            prop_assert!(!fixed.contains(addr));
                            held.push((addr, false));
                        }
                    }
                    PoolOp::Release(i) if !held.is_empty() => {
                        let (addr, is_static) = held.swap_remove(i % held.len());
                        let pool = if is_static { &fixed } else { &dynamic };
                        prop_assert!(pool.release(addr));
                    }
                    PoolOp::Release(_) => {}
                }

                for last in 16..32u8 {
                    let addr = Ipv4Addr::new(10, 60, 0, last);
                    prop_assert!(!(fixed.is_free(addr) && dynamic.is_free(addr)));
                }
            }
        }

        /// Release undoes allocate; releasing again changes nothing
        #[test]
        fn prop_allocate_release_round_trip(prefix in 24u8..30, preferred in any::<u8>()) {
            let pool = UeIpPool::new(&format!("10.70.1.0/{}", prefix)).unwrap();
            let before = pool.free_count();

            let addr = pool.allocate(Some(Ipv4Addr::new(10, 70, 1, preferred))).unwrap();
            prop_assert_eq!(pool.free_count(), before - 1);
            prop_assert!(pool.release(addr));
            prop_assert_eq!(pool.free_count(), before);

            prop_assert!(!pool.release(addr));
            prop_assert_eq!(pool.free_count(), before);
        }
    }

    // ========================================================================
    // Pending set
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// N accepted answers in any order give exactly one outcome
        #[test]
        fn prop_pending_set_converges(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(), n in 0usize..6) {
            let mut ctx = SmContext::new(1, "imsi-001010000000001", 5, SNssai::new(1, None), "internet");
            let nodes: Vec<String> = (0..n).map(|i| format!("UPF{}", i)).collect();
            let mut rx = ctx.begin_pending(PendingOp::Update, nodes.clone());

            let mut outcomes = Vec::new();
            for i in order.into_iter().filter(|&i| i < n) {
                prop_assert!(rx.try_recv().is_err());
                outcomes.extend(ctx.node_responded(&nodes[i], true));
            }

            prop_assert_eq!(rx.try_recv().ok(), Some(PfcpOutcome::SessionUpdateSuccess));
            prop_assert!(outcomes.len() == usize::from(n > 0));
            prop_assert!(!ctx.has_pending());
        }
    }

    // ========================================================================
    // Rule lifecycle
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// A rule never sent only ever goes to create; after a sync nothing
        /// is sent again until it is marked again
        #[test]
        fn prop_rule_sections_follow_lifecycle(ops in prop::collection::vec(arb_rule_op(), 1..40)) {
            let mut table: RuleTable<Pdr> = RuleTable::default();
            let mut sent: BTreeSet<u16> = BTreeSet::new();

            for op in ops {
                match op {
                    RuleOp::Insert(id) => {
                        if table.get(id).is_none() {
                            table.insert(Pdr::new(id, u32::from(id), 255));
                        }
                    }
                    RuleOp::Update(id) => {
                        table.mark_update(id);
                    }
                    RuleOp::Remove(id) => {
                        if let Some(dropped) = table.mark_remove(id) {
                            prop_assert!(!sent.contains(&dropped));
                        }
                    }
                    RuleOp::Sync => {
                        table.commit();
                        sent = table.iter().map(|p| p.id).collect();
                        prop_assert!(table.partition().is_empty());
                    }
                }

                let sections = table.partition();
                for pdr in &sections.create {
                    prop_assert!(!sent.contains(&pdr.id));
                }
                for pdr in &sections.update {
                    prop_assert!(sent.contains(&pdr.id));
                }
                for id in &sections.remove {
                    prop_assert!(sent.contains(id));
                }
            }
        }
    }
}
