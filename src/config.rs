/// Reward paid by the best state in a task (label 3 × 100); sets the
/// denominator of the per-point dollar rate.
pub const MAX_REWARD_PER_TRIAL: u64 = 300;

#[derive(Clone, Debug)]
pub struct Config {
    pub max_trials: u32,
    pub min_trials: u32,
    pub naive_trials: u32,
    pub debug: bool,
    pub secret_key: Option<String>,
    pub task_db_path: String,
    pub sqlite_path: String,
    pub task_ids: Vec<u32>,
    /// Dollars paid for a perfect run
    pub max_winnings: f64,
    pub bind: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_trials: std::env::var("MAX_TRIALS").ok().and_then(|v| v.parse().ok()).unwrap_or(500),
            min_trials: std::env::var("MIN_TRIALS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            naive_trials: std::env::var("NAIVE_TRIALS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            debug: std::env::var("DEBUG").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(false),
            secret_key: std::env::var("SECRET_KEY").ok().filter(|v| !v.is_empty()),
            task_db_path: std::env::var("TASK_DB_PATH").unwrap_or_else(|_| "./data/tasks.json".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./experiment.sqlite".to_string()),
            task_ids: std::env::var("TASK_IDS")
                .ok()
                .map(|v| parse_task_ids(&v))
                .unwrap_or_else(|| vec![3151, 13151]),
            max_winnings: std::env::var("MAX_WINNINGS").ok().and_then(|v| v.parse().ok()).unwrap_or(15.0),
            bind: std::env::var("BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_trials: self.max_trials,
            min_trials: self.min_trials,
            naive_trials: self.naive_trials,
            debug: self.debug,
        }
    }

    /// Dollars per point. Zero when the configuration leaves no rewarded trials.
    pub fn unit_winnings(&self) -> f64 {
        let rewarded = self.max_trials.saturating_sub(self.naive_trials) as u64;
        if rewarded == 0 {
            return 0.0;
        }
        self.max_winnings / (MAX_REWARD_PER_TRIAL * rewarded) as f64
    }
}

fn parse_task_ids(raw: &str) -> Vec<u32> {
    raw.split(',').filter_map(|v| v.trim().parse().ok()).collect()
}

/// Trial-count policy handed to each engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Hard cap on trials per session
    pub max_trials: u32,
    /// Completed trials needed for a confirmation token
    pub min_trials: u32,
    /// Length of the zero-reward orientation phase
    pub naive_trials: u32,
    /// Include targets and rewards of both options in exports
    pub debug: bool,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.naive_trials == 0 {
            return Err("naive_trials must be at least 1".to_string());
        }
        if self.naive_trials > self.max_trials {
            return Err(format!(
                "naive_trials ({}) exceeds max_trials ({})",
                self.naive_trials, self.max_trials
            ));
        }
        if self.min_trials > self.max_trials {
            return Err(format!(
                "min_trials ({}) exceeds max_trials ({})",
                self.min_trials, self.max_trials
            ));
        }
        Ok(())
    }
}
