//! End-to-end walk through a small reward graph.
//!
//! Two states labelled 1 and 3, two naive trials, then A/B choices that
//! bounce between the states.

use std::path::Path;
use std::sync::Arc;

use multilevel_markov::config::EngineConfig;
use multilevel_markov::engine::{confirmation_token, Choice, NextTrial, Summary, TrialEngine, TrialOptions};
use multilevel_markov::task::{TaskCatalog, TaskDefinition, TaskSource};
use multilevel_markov::verify;

fn task() -> Arc<TaskDefinition> {
    Arc::new(TaskDefinition::new(vec![1, 3], vec![[0, 1], [1, 0]]).unwrap())
}

fn policy(debug: bool) -> EngineConfig {
    EngineConfig { max_trials: 5, min_trials: 2, naive_trials: 2, debug }
}

fn offer(engine: &mut TrialEngine) -> TrialOptions {
    match engine.get_next_options() {
        Some(NextTrial::Options(o)) => o,
        other => panic!("expected options, got {:?}", other),
    }
}

#[test]
fn test_walkthrough_rewards_and_states() {
    let mut engine = TrialEngine::with_task(3151, Some(task()), policy(false));
    let mut seen = Vec::new();

    for choice in [Choice::A, Choice::A, Choice::B, Choice::A] {
        let o = offer(&mut engine);
        seen.push((o.reward_a, o.reward_b));
        engine.record_response(choice, o.reward_for(choice));
    }

    assert_eq!(seen, vec![(0, 0), (0, 0), (100, 300), (300, 100)]);
    assert_eq!(engine.current_trial(), 4);
    assert_eq!(engine.current_state(), Some(1));
    assert_eq!(engine.cumulative_points(), 600);
    assert!(verify::check_all(&engine, &task()).is_empty());

    match engine.summarize_for_persistence("abcDEF0123", "pepper").unwrap() {
        Summary::Complete { records, confirmation } => {
            assert_eq!(records.len(), 4);
            assert_eq!(confirmation, confirmation_token("abcDEF0123", "pepper"));
            let states: Vec<i64> = records.iter().map(|r| r.state).collect();
            assert_eq!(states, vec![-1, -1, 0, 1]);
            let rewards: Vec<u64> = records.iter().map(|r| r.reward).collect();
            assert_eq!(rewards, vec![0, 0, 300, 300]);
            assert!(records.iter().all(|r| r.debug.is_none()));
        }
        other => panic!("expected a complete summary, got {:?}", other),
    }
}

#[test]
fn test_trial_cap_ends_session() {
    let mut engine = TrialEngine::with_task(3151, Some(task()), policy(false));
    for _ in 0..5 {
        assert!(engine.respond(Choice::B).is_some());
    }
    assert_eq!(engine.get_next_options(), Some(NextTrial::Finished));
    assert_eq!(engine.respond(Choice::A), None);
    assert_eq!(engine.completed_trials(), 5);
    assert_eq!(engine.trial_log().len(), 5);
}

#[test]
fn test_preview_is_idempotent_within_a_trial() {
    let mut engine = TrialEngine::with_task(3151, Some(task()), policy(false));
    engine.respond(Choice::A);
    engine.respond(Choice::A);
    let first = offer(&mut engine);
    let again = offer(&mut engine);
    assert_eq!(first, again);
    assert_eq!(engine.trial_log().len(), 3);
    assert_eq!(engine.response_log().len(), 2);
    assert!(verify::check_all(&engine, &task()).is_empty());
}

#[test]
fn test_debug_export_marks_naive_rows() {
    let mut engine = TrialEngine::with_task(3151, Some(task()), policy(true));
    engine.respond(Choice::A);
    engine.respond(Choice::B);
    engine.respond(Choice::B);

    let summary = engine.summarize_for_persistence("abcDEF0123", "pepper").unwrap();
    let debug: Vec<_> = summary.records().iter().map(|r| r.debug.unwrap()).collect();
    assert!(debug[0].naive && debug[1].naive && !debug[2].naive);
    assert_eq!((debug[0].state_a, debug[0].state_b), (-1, -1));
    assert_eq!((debug[1].state_a, debug[1].state_b), (0, 0));
    assert_eq!((debug[2].state_a, debug[2].state_b), (0, 1));
    assert_eq!((debug[2].reward_a, debug[2].reward_b), (100, 300));
}

#[test]
fn test_too_few_trials_is_incomplete() {
    let mut engine = TrialEngine::with_task(3151, Some(task()), policy(false));
    engine.respond(Choice::A);
    let summary = engine.summarize_for_persistence("abcDEF0123", "pepper").unwrap();
    assert!(!summary.is_complete());
    assert_eq!(summary.records().len(), 1);
}

#[test]
fn test_shipped_catalog_loads() {
    let path = Path::new("data/tasks.json");
    if !path.exists() {
        eprintln!("SKIP: {} not found", path.display());
        return;
    }
    let catalog = TaskCatalog::load(path).unwrap();
    for id in [3151, 13151] {
        let def = catalog.task(id).unwrap().unwrap();
        assert_eq!(def.reachable_from_entry().len(), def.n_states());
        assert!(def.max_label() <= 3);

        let mut engine = TrialEngine::new(id, &catalog, EngineConfig {
            max_trials: 40,
            min_trials: 30,
            naive_trials: 5,
            debug: true,
        });
        while engine.respond(if engine.current_trial() % 3 == 0 { Choice::B } else { Choice::A }).is_some() {}
        assert_eq!(engine.completed_trials(), 40);
        assert!(verify::check_all(&engine, &def).is_empty());
    }
}
