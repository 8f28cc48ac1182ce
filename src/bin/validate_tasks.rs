use multilevel_markov::config::Config;
use multilevel_markov::engine::PAYOFF_SCALE;
use multilevel_markov::task::TaskCatalog;
use serde_json::json;
use std::env;
use std::path::Path;

fn main() {
    let cfg = Config::from_env();
    let path = env::args().nth(1).unwrap_or_else(|| cfg.task_db_path.clone());

    let catalog = match TaskCatalog::load(Path::new(&path)) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("catalog check failed: {:#}", err);
            std::process::exit(1);
        }
    };

    let mut unreachable = 0usize;
    for (id, task) in catalog.iter() {
        let reachable = task.reachable_from_entry().len();
        if reachable < task.n_states() {
            unreachable += task.n_states() - reachable;
        }
        println!(
            "{}",
            json!({
                "task_id": id,
                "states": task.n_states(),
                "reachable": reachable,
                "max_reward": task.max_label() as u64 * PAYOFF_SCALE,
                "configured": cfg.task_ids.contains(&id),
            })
        );
    }

    let missing: Vec<u32> = cfg
        .task_ids
        .iter()
        .copied()
        .filter(|id| !catalog.ids().contains(id))
        .collect();

    println!(
        "{}",
        json!({
            "path": path,
            "tasks": catalog.len(),
            "sha256": catalog.digest(),
            "unreachable_states": unreachable,
            "missing_configured": missing,
        })
    );

    if !missing.is_empty() {
        eprintln!("configured tasks missing from catalog: {:?}", missing);
        std::process::exit(2);
    }
}
