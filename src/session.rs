//! Live participant sessions.
//!
//! The registry owns one engine per participant id. A session is inserted
//! on first login and removed once its trials are flushed to a sink; the
//! request handler holds the registry and serializes access to it.

use anyhow::{anyhow, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use crate::config::Config;
use crate::engine::{Reward, Summary, TrialEngine};
use crate::logging::{log_session, obj, v_num, v_str, Level};
use crate::storage::{destination_name, valid_tasks, TrialSink};
use crate::task::{TaskId, TaskSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { task_id: TaskId },
    /// The participant already has a live session
    Resumed { task_id: TaskId },
    /// Every configured task was already attempted
    NoTasks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    NotStarted,
    NoTrials,
    Incomplete { destination: String, trials: usize },
    Confirmed { destination: String, confirmation: String },
}

impl FinishOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            FinishOutcome::NotStarted => "not_started",
            FinishOutcome::NoTrials => "no_trials",
            FinishOutcome::Incomplete { .. } => "not_enough_trials",
            FinishOutcome::Confirmed { .. } => "confirmed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub points: Reward,
    pub trial: u32,
    /// Dollars, rounded to cents
    pub winnings: f64,
}

pub struct SessionRegistry {
    cfg: Config,
    secret: String,
    engines: HashMap<String, TrialEngine>,
}

impl SessionRegistry {
    pub fn new(cfg: Config, secret: String) -> Self {
        Self { cfg, secret, engines: HashMap::new() }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.engines.contains_key(uid)
    }

    pub fn engine(&self, uid: &str) -> Option<&TrialEngine> {
        self.engines.get(uid)
    }

    pub fn engine_mut(&mut self, uid: &str) -> Option<&mut TrialEngine> {
        self.engines.get_mut(uid)
    }

    /// Resume a live session or assign a random task the participant has
    /// not attempted yet.
    pub fn start<S, T, R>(&mut self, uid: &str, source: &S, sink: &T, rng: &mut R) -> Result<StartOutcome>
    where
        S: TaskSource + ?Sized,
        T: TrialSink + ?Sized,
        R: Rng + ?Sized,
    {
        if let Some(engine) = self.engines.get(uid) {
            return Ok(StartOutcome::Resumed { task_id: engine.task_id() });
        }

        let destinations = sink.destinations()?;
        let candidates = valid_tasks(uid, &self.cfg.task_ids, &destinations);
        let Some(&task_id) = candidates.choose(rng) else {
            log_session(Level::Info, uid, "no_tasks_left", obj(&[]));
            return Ok(StartOutcome::NoTasks);
        };

        let engine = TrialEngine::new(task_id, source, self.cfg.engine_config());
        if !engine.is_ready() {
            return Err(anyhow!("task {} could not be loaded", task_id));
        }
        self.engines.insert(uid.to_string(), engine);
        log_session(
            Level::Info,
            uid,
            "session_started",
            obj(&[("task_id", json!(task_id)), ("live_sessions", json!(self.engines.len()))]),
        );
        Ok(StartOutcome::Started { task_id })
    }

    pub fn progress(&self, uid: &str) -> Option<Progress> {
        let engine = self.engines.get(uid)?;
        let points = engine.cumulative_points();
        Some(Progress { points, trial: engine.current_trial(), winnings: self.winnings(points) })
    }

    /// Dollars for `points`, rounded to cents.
    fn winnings(&self, points: Reward) -> f64 {
        (points as f64 * self.cfg.unit_winnings() * 100.0).round() / 100.0
    }

    /// Flush the participant's trials to `sink` and end the session.
    ///
    /// A log desync or a failed write leaves the session and its trials in
    /// place; nothing is written on desync.
    pub fn finish<T: TrialSink + ?Sized>(&mut self, uid: &str, sink: &mut T) -> Result<FinishOutcome> {
        let Some(engine) = self.engines.get(uid) else {
            return Ok(FinishOutcome::NotStarted);
        };
        let task_id = engine.task_id();
        let points = engine.cumulative_points();

        let summary = match engine.summarize_for_persistence(uid, &self.secret) {
            Ok(summary) => summary,
            Err(desync) => {
                return Err(anyhow!(
                    "trial/response logs diverge at index {} ({:?} vs {})",
                    desync.index,
                    desync.trial_log,
                    desync.response_log
                ));
            }
        };

        let summary_status = summary.status();
        let outcome = match summary {
            Summary::NoTrials => FinishOutcome::NoTrials,
            Summary::Incomplete { records } => {
                let destination = destination_name(uid, task_id, false);
                sink.insert_many(&destination, &records)?;
                FinishOutcome::Incomplete { destination, trials: records.len() }
            }
            Summary::Complete { records, confirmation } => {
                let destination = destination_name(uid, task_id, true);
                sink.insert_many(&destination, &records)?;
                FinishOutcome::Confirmed { destination, confirmation }
            }
        };

        self.engines.remove(uid);
        log_session(
            Level::Info,
            uid,
            "session_finished",
            obj(&[
                ("task_id", json!(task_id)),
                ("summary", v_str(summary_status)),
                ("status", v_str(outcome.status())),
                ("points", json!(points)),
                ("winnings", v_num(self.winnings(points))),
            ]),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{confirmation_token, Choice};
    use crate::storage::MemorySink;
    use crate::task::{TaskCatalog, TaskDefinition};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const UID: &str = "abcDEF0123";

    fn make_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.max_trials = 10;
        cfg.min_trials = 3;
        cfg.naive_trials = 1;
        cfg.debug = false;
        cfg.max_winnings = 27.0;
        cfg.task_ids = vec![1, 2];
        cfg
    }

    fn catalog() -> TaskCatalog {
        TaskCatalog::from_tasks([
            (1, TaskDefinition::new(vec![1, 3], vec![[0, 1], [1, 0]]).unwrap()),
            (2, TaskDefinition::new(vec![3], vec![[0, 0]]).unwrap()),
        ])
        .unwrap()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(make_config(), "s3cret".to_string())
    }

    #[test]
    fn test_start_then_resume() {
        let mut reg = registry();
        let sink = MemorySink::new();
        let mut rng = StdRng::seed_from_u64(1);
        let first = reg.start(UID, &catalog(), &sink, &mut rng).unwrap();
        let StartOutcome::Started { task_id } = first else {
            panic!("expected a fresh session, got {:?}", first);
        };
        assert_eq!(reg.start(UID, &catalog(), &sink, &mut rng).unwrap(), StartOutcome::Resumed { task_id });
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_start_skips_played_tasks() {
        let mut reg = registry();
        let mut sink = MemorySink::new();
        sink.insert_many(&destination_name(UID, 1, false), &[]).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(
            reg.start(UID, &catalog(), &sink, &mut rng).unwrap(),
            StartOutcome::Started { task_id: 2 }
        );
    }

    #[test]
    fn test_no_tasks_left() {
        let mut reg = registry();
        let mut sink = MemorySink::new();
        sink.insert_many(&destination_name(UID, 1, true), &[]).unwrap();
        sink.insert_many(&destination_name(UID, 2, false), &[]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(reg.start(UID, &catalog(), &sink, &mut rng).unwrap(), StartOutcome::NoTasks);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unloadable_task_is_an_error() {
        let mut cfg = make_config();
        cfg.task_ids = vec![404];
        let mut reg = SessionRegistry::new(cfg, "s".to_string());
        let mut rng = StdRng::seed_from_u64(3);
        assert!(reg.start(UID, &catalog(), &MemorySink::new(), &mut rng).is_err());
        assert!(!reg.contains(UID));
    }

    #[test]
    fn test_progress_winnings() {
        let mut reg = registry();
        let mut cfg = make_config();
        cfg.task_ids = vec![2];
        reg.cfg = cfg;
        let mut rng = StdRng::seed_from_u64(3);
        reg.start(UID, &catalog(), &MemorySink::new(), &mut rng).unwrap();
        let engine = reg.engine_mut(UID).unwrap();
        engine.respond(Choice::A);
        engine.respond(Choice::A);
        // 27 dollars over 9 rewarded trials of 300 points: one cent per point
        let progress = reg.progress(UID).unwrap();
        assert_eq!(progress.points, 300);
        assert_eq!(progress.trial, 2);
        assert!((progress.winnings - 3.0).abs() < 1e-9);
        assert!(reg.progress("nobody0000").is_none());
    }

    #[test]
    fn test_finish_outcomes() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut sink = MemorySink::new();

        let mut reg = registry();
        assert_eq!(reg.finish(UID, &mut sink).unwrap(), FinishOutcome::NotStarted);

        reg.start(UID, &catalog(), &sink, &mut rng).unwrap();
        assert_eq!(reg.finish(UID, &mut sink).unwrap(), FinishOutcome::NoTrials);
        assert!(!reg.contains(UID));
        assert!(sink.destinations().unwrap().is_empty());

        reg.start(UID, &catalog(), &sink, &mut rng).unwrap();
        let task_id = reg.engine(UID).unwrap().task_id();
        reg.engine_mut(UID).unwrap().respond(Choice::B);
        let outcome = reg.finish(UID, &mut sink).unwrap();
        let expected = destination_name(UID, task_id, false);
        assert_eq!(outcome, FinishOutcome::Incomplete { destination: expected.clone(), trials: 1 });
        assert_eq!(sink.records(&expected).unwrap().len(), 1);

        let other = "zyxWVU9876";
        reg.start(other, &catalog(), &sink, &mut rng).unwrap();
        let task_id = reg.engine(other).unwrap().task_id();
        for _ in 0..3 {
            reg.engine_mut(other).unwrap().respond(Choice::A);
        }
        let outcome = reg.finish(other, &mut sink).unwrap();
        assert_eq!(
            outcome,
            FinishOutcome::Confirmed {
                destination: destination_name(other, task_id, true),
                confirmation: confirmation_token(other, "s3cret"),
            }
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_desync_keeps_session_without_writing() {
        let mut reg = registry();
        let mut sink = MemorySink::new();
        let mut rng = StdRng::seed_from_u64(5);
        reg.start(UID, &catalog(), &sink, &mut rng).unwrap();
        let engine = reg.engine_mut(UID).unwrap();
        for _ in 0..3 {
            engine.respond(Choice::A);
        }
        // answered without a preview, so the trial log falls behind
        engine.record_response(Choice::B, 0);

        assert!(reg.finish(UID, &mut sink).is_err());
        assert!(reg.contains(UID));
        assert_eq!(reg.engine(UID).unwrap().completed_trials(), 4);
        assert!(sink.destinations().unwrap().is_empty());

        // still there on a second attempt
        assert!(reg.finish(UID, &mut sink).is_err());
        assert!(reg.contains(UID));
    }
}
