use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;

use multilevel_markov::config::Config;
use multilevel_markov::logging::{log, obj, v_bool, v_str, Domain, Level};
use multilevel_markov::server::Server;
use multilevel_markov::session::SessionRegistry;
use multilevel_markov::storage::SqliteStore;
use multilevel_markov::task::TaskCatalog;

fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.engine_config().validate().map_err(|e| anyhow!("invalid trial policy: {}", e))?;
    let secret = cfg
        .secret_key
        .clone()
        .ok_or_else(|| anyhow!("SECRET_KEY must be set"))?;

    let catalog = TaskCatalog::load(Path::new(&cfg.task_db_path))?;
    for id in &cfg.task_ids {
        if !catalog.ids().contains(id) {
            return Err(anyhow!("task {} is configured but missing from {}", id, cfg.task_db_path));
        }
    }

    let mut store = SqliteStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let listener = TcpListener::bind(&cfg.bind)?;
    log(
        Level::Info,
        Domain::System,
        "server_started",
        obj(&[
            ("bind", v_str(&cfg.bind)),
            ("tasks", json!(cfg.task_ids)),
            ("max_trials", json!(cfg.max_trials)),
            ("min_trials", json!(cfg.min_trials)),
            ("naive_trials", json!(cfg.naive_trials)),
            ("debug", v_bool(cfg.debug)),
            ("catalog_sha256", v_str(catalog.digest())),
        ]),
    );

    let registry = SessionRegistry::new(cfg, secret);
    let mut server = Server::new(registry, catalog, store, StdRng::from_entropy());

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(_) => continue,
        };

        let request = match BufReader::new(&stream).lines().next() {
            Some(Ok(line)) => line,
            _ => continue,
        };

        let response = server.handle(&request);
        let _ = stream.write_all(response.to_http().as_bytes());
    }
    Ok(())
}
