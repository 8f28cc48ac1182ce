//! Dry run of one task with a random participant.
//!
//! Usage: simulate [catalog.json] [task_id] [seed]

use multilevel_markov::config::Config;
use multilevel_markov::engine::{Choice, NextTrial};
use multilevel_markov::participant::generate_uid;
use multilevel_markov::session::{FinishOutcome, SessionRegistry, StartOutcome};
use multilevel_markov::storage::{MemorySink, TrialSink};
use multilevel_markov::task::{TaskCatalog, TaskSource};
use multilevel_markov::verify;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::env;
use std::path::Path;

fn main() {
    let mut cfg = Config::from_env();
    let catalog_path = env::args().nth(1).unwrap_or_else(|| cfg.task_db_path.clone());
    let task_id = env::args()
        .nth(2)
        .and_then(|v| v.parse().ok())
        .or_else(|| cfg.task_ids.first().copied())
        .unwrap_or(3151);
    let seed = env::args().nth(3).and_then(|v| v.parse().ok()).unwrap_or(42u64);

    if let Err(err) = cfg.engine_config().validate() {
        eprintln!("invalid trial policy: {}", err);
        std::process::exit(1);
    }

    let catalog = match TaskCatalog::load(Path::new(&catalog_path)) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("failed to load {}: {:#}", catalog_path, err);
            std::process::exit(1);
        }
    };
    let task = match catalog.task(task_id) {
        Ok(Some(t)) => t,
        _ => {
            eprintln!("task {} not in {}", task_id, catalog_path);
            std::process::exit(2);
        }
    };

    cfg.task_ids = vec![task_id];
    let secret = cfg.secret_key.clone().unwrap_or_else(|| "simulation".to_string());
    let mut registry = SessionRegistry::new(cfg, secret);
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(seed);

    let uid = generate_uid(&mut rng, &[]);
    match registry.start(&uid, &catalog, &sink, &mut rng) {
        Ok(StartOutcome::Started { .. }) => {}
        Ok(other) => {
            eprintln!("unexpected start outcome: {:?}", other);
            std::process::exit(3);
        }
        Err(err) => {
            eprintln!("start failed: {:#}", err);
            std::process::exit(3);
        }
    }

    let mut visits = vec![0u32; task.n_states()];
    let mut choices_a = 0u32;
    if let Some(engine) = registry.engine_mut(&uid) {
        while let Some(NextTrial::Options(_)) = engine.get_next_options() {
            let choice = if rng.gen_bool(0.5) { Choice::A } else { Choice::B };
            if choice == Choice::A {
                choices_a += 1;
            }
            engine.respond(choice);
            if let Some(state) = engine.current_state() {
                visits[state] += 1;
            }
        }

        let violations = verify::check_all(engine, &task);
        if !violations.is_empty() {
            for v in &violations {
                eprintln!("invariant violated: {}", v.msg);
            }
            std::process::exit(4);
        }
    }

    let progress = registry.progress(&uid);
    let outcome = match registry.finish(&uid, &mut sink) {
        Ok(o) => o,
        Err(err) => {
            eprintln!("flush failed: {:#}", err);
            std::process::exit(5);
        }
    };
    let rows = match &outcome {
        FinishOutcome::Incomplete { destination, .. } | FinishOutcome::Confirmed { destination, .. } => {
            sink.records(destination).map(|r| r.len()).unwrap_or(0)
        }
        _ => 0,
    };

    let report = json!({
        "participant": uid,
        "task_id": task_id,
        "seed": seed,
        "progress": progress,
        "choices_a": choices_a,
        "state_visits": visits,
        "status": outcome.status(),
        "rows": rows,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(s) => println!("{}", s),
        Err(err) => eprintln!("failed to render report: {}", err),
    }
}
