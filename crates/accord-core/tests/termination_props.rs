use accord_core::simulator::check_session;
use accord_core::{run_session, EvaluationDraft, SafetyPolicy};
use accord_test_utils::{edit, graph, ScriptedOracle};
use proptest::prelude::*;
use std::sync::Arc;

fn vote(choice: u8) -> EvaluationDraft {
    match choice % 4 {
        0 => EvaluationDraft::accept(),
        1 => EvaluationDraft::reject(),
        2 => EvaluationDraft::defer(),
        _ => EvaluationDraft::counter(edit("src/counter.rs")),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_session_terminates_within_round_cap(
        max_rounds in 0u32..8,
        per_agent in 0usize..6,
        per_round in 0usize..3,
        total in 0usize..12,
        threshold in 0usize..4,
        arbitration in any::<bool>(),
        votes in proptest::collection::vec(any::<u8>(), 4),
    ) {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let oracle = Arc::new(
            ScriptedOracle::new()
                .propose_always("a", edit("src/a.rs"))
                .propose_always("b", edit("src/b.rs"))
                .propose_always("c", edit("src/c.rs").targeting("d"))
                .propose_always("d", edit("Cargo.lock"))
                .vote("a", vote(votes[0]))
                .vote("b", vote(votes[1]))
                .vote("c", vote(votes[2]))
                .vote("d", vote(votes[3])),
        );
        let policy = SafetyPolicy::new()
            .with_max_rounds(max_rounds)
            .with_max_proposals_per_agent(per_agent)
            .with_max_proposals_per_round(per_round)
            .with_max_total_resources(total)
            .with_convergence_threshold(threshold)
            .with_arbitration_required(arbitration)
            .protect("Cargo.lock");

        let summary = tokio_test::block_on(run_session(g.clone(), policy.clone(), oracle)).unwrap();

        prop_assert!(summary.rounds_executed <= max_rounds);
        prop_assert!(summary.resources_modified <= total);
        let violations = check_session(&g, &policy, &summary);
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }
}
