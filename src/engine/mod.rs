//! Trial engine: one participant working through one task.
//!
//! ```text
//!  naive phase (N trials, no rewards)         reward graph
//! ┌────┐   ┌────┐        ┌──────┐       ┌─────────┐  A/B  ┌─────────┐
//! │ t0 │──►│ t1 │─ ... ─►│ tN-1 │──────►│ state 0 │──────►│ state k │─► ...
//! └────┘   └────┘        └──────┘       └─────────┘       └─────────┘
//! ```
//!
//! `get_next_options` previews the current trial and logs it once per trial
//! index; `record_response` is the only operation that advances the trial
//! counter or moves through the graph. The trial and response logs advance
//! in lockstep and are paired again by `summarize_for_persistence`.

pub mod records;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::logging::{log, log_trial, obj, v_str, Domain, Level};
use crate::task::{TaskDefinition, TaskId, TaskSource, ENTRY_STATE};

pub use records::{
    confirmation_token, ExportRecord, LogDesync, NextTrial, ResponseRecord, Summary, TrialOptions,
    TrialRecord,
};

/// Points; never negative so cumulative totals only grow.
pub type Reward = u64;

/// State label to points.
pub const PAYOFF_SCALE: Reward = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Choice {
    A,
    B,
}

impl Choice {
    /// Column of `state_transitions` this choice follows.
    pub fn branch(self) -> usize {
        match self {
            Choice::A => 0,
            Choice::B => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Choice::A => "A",
            Choice::B => "B",
        }
    }
}

impl FromStr for Choice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Choice::A),
            "B" | "b" => Ok(Choice::B),
            other => Err(format!("unknown option: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrialEngine {
    task_id: TaskId,
    /// `None` keeps the engine not-ready
    task: Option<Arc<TaskDefinition>>,
    cfg: EngineConfig,
    current_trial: u32,
    /// `None` until the participant enters the graph
    current_state: Option<usize>,
    trial_log: Vec<TrialRecord>,
    response_log: Vec<ResponseRecord>,
    cumulative_points: Reward,
}

impl TrialEngine {
    /// Look the task up in `source`. An unknown id, an unavailable source, a
    /// malformed graph or an invalid policy leaves the engine not-ready;
    /// every operation on it is then a no-op.
    pub fn new<S: TaskSource + ?Sized>(task_id: TaskId, source: &S, cfg: EngineConfig) -> Self {
        let task = match source.task(task_id) {
            Ok(Some(task)) => Some(task),
            Ok(None) => {
                log(
                    Level::Error,
                    Domain::Task,
                    "task_not_found",
                    obj(&[("task_id", json!(task_id))]),
                );
                None
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Task,
                    "task_source_unavailable",
                    obj(&[("task_id", json!(task_id)), ("error", v_str(&format!("{err:#}")))]),
                );
                None
            }
        };
        Self::with_task(task_id, task, cfg)
    }

    pub fn with_task(task_id: TaskId, task: Option<Arc<TaskDefinition>>, cfg: EngineConfig) -> Self {
        let task = match cfg.validate() {
            Ok(()) => task,
            Err(msg) => {
                log(
                    Level::Error,
                    Domain::Task,
                    "invalid_policy",
                    obj(&[("task_id", json!(task_id)), ("error", v_str(&msg))]),
                );
                None
            }
        };
        let task = task.filter(|def| match def.validate() {
            Ok(()) => true,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Task,
                    "malformed_task",
                    obj(&[("task_id", json!(task_id)), ("error", v_str(&format!("{err:?}")))]),
                );
                false
            }
        });
        Self {
            task_id,
            task,
            cfg,
            current_trial: 0,
            current_state: None,
            trial_log: Vec::new(),
            response_log: Vec::new(),
            cumulative_points: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.task.is_some()
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn current_trial(&self) -> u32 {
        self.current_trial
    }

    pub fn current_state(&self) -> Option<usize> {
        self.current_state
    }

    pub fn cumulative_points(&self) -> Reward {
        self.cumulative_points
    }

    pub fn trial_log(&self) -> &[TrialRecord] {
        &self.trial_log
    }

    pub fn response_log(&self) -> &[ResponseRecord] {
        &self.response_log
    }

    pub fn completed_trials(&self) -> usize {
        self.response_log.len()
    }

    /// Options for the current trial, `Finished` once `max_trials` is
    /// reached, `None` when not ready. Repeated calls within one trial
    /// return the logged offer instead of appending another.
    pub fn get_next_options(&mut self) -> Option<NextTrial> {
        let task = self.task.as_ref()?;
        if self.current_trial >= self.cfg.max_trials {
            return Some(NextTrial::Finished);
        }
        if let Some(last) = self.trial_log.last() {
            if last.trial == self.current_trial {
                return Some(NextTrial::Options(last.options()));
            }
        }

        let offer = self.preview(task);
        log_trial(
            self.task_id,
            "offer",
            obj(&[
                ("trial", json!(offer.trial)),
                ("state", json!(records::state_code(offer.state))),
                ("reward_a", json!(offer.reward_a)),
                ("reward_b", json!(offer.reward_b)),
            ]),
        );
        self.trial_log.push(offer);
        Some(NextTrial::Options(offer.options()))
    }

    fn preview(&self, task: &TaskDefinition) -> TrialRecord {
        let naive = self.cfg.naive_trials;
        let (target_a, target_b, reward_a, reward_b) = match self.current_state {
            None if self.current_trial + 1 < naive => (None, None, 0, 0),
            // last naive trial: both options lead into the graph, still unpaid
            None if self.current_trial + 1 == naive => {
                (Some(ENTRY_STATE), Some(ENTRY_STATE), 0, 0)
            }
            state => {
                let [a, b] = task.state_transitions[state.unwrap_or(ENTRY_STATE)];
                (Some(a), Some(b), payoff(task, a), payoff(task, b))
            }
        };
        TrialRecord {
            trial: self.current_trial,
            state: self.current_state,
            target_a,
            target_b,
            reward_a,
            reward_b,
        }
    }

    /// Move to the state that follows `choice`. Runs after the trial
    /// counter has been advanced, so trial `N` is the entry trial.
    pub fn update_state(&mut self, choice: Choice) {
        let Some(task) = self.task.as_ref() else {
            return;
        };
        let naive = self.cfg.naive_trials;
        self.current_state = if self.current_trial < naive {
            None
        } else if self.current_trial == naive {
            Some(ENTRY_STATE)
        } else {
            let from = self.current_state.unwrap_or(ENTRY_STATE);
            Some(task.state_transitions[from][choice.branch()])
        };
    }

    /// Log the response, bank the reward, advance the trial and the state.
    pub fn record_response(&mut self, choice: Choice, reward: Reward) {
        if !self.is_ready() {
            return;
        }
        self.response_log.push(ResponseRecord {
            trial: self.current_trial,
            choice,
            reward,
            time: response_timestamp(),
        });
        self.cumulative_points = self.cumulative_points.saturating_add(reward);
        self.current_trial += 1;
        self.update_state(choice);

        log_trial(
            self.task_id,
            "response",
            obj(&[
                ("trial", json!(self.current_trial - 1)),
                ("choice", v_str(choice.as_str())),
                ("reward", json!(reward)),
                ("points", json!(self.cumulative_points)),
                ("next_state", json!(records::state_code(self.current_state))),
            ]),
        );
    }

    /// Preview the current trial and record `choice` at its offered reward.
    /// `None` when not ready or out of trials.
    pub fn respond(&mut self, choice: Choice) -> Option<Reward> {
        match self.get_next_options()? {
            NextTrial::Options(options) => {
                let reward = options.reward_for(choice);
                self.record_response(choice, reward);
                Some(reward)
            }
            NextTrial::Finished => None,
        }
    }

    /// Pair both logs into export records. The caller owns the write.
    pub fn summarize_for_persistence(
        &self,
        participant_id: &str,
        secret: &str,
    ) -> Result<Summary, LogDesync> {
        let completed = self.response_log.len();
        if completed == 0 {
            return Ok(Summary::NoTrials);
        }

        let mut records = Vec::with_capacity(completed);
        for (index, response) in self.response_log.iter().enumerate() {
            let offer = self.trial_log.get(index);
            match offer {
                Some(offer) if offer.trial == response.trial => {
                    records.push(ExportRecord::from_pair(offer, response, self.cfg.debug));
                }
                _ => {
                    let desync = LogDesync {
                        index,
                        trial_log: offer.map(|o| o.trial),
                        response_log: response.trial,
                    };
                    log(
                        Level::Fatal,
                        Domain::Trial,
                        "log_desync",
                        obj(&[
                            ("participant", v_str(participant_id)),
                            ("task_id", json!(self.task_id)),
                            ("index", json!(index)),
                            ("trial_log", json!(desync.trial_log)),
                            ("response_log", json!(desync.response_log)),
                        ]),
                    );
                    return Err(desync);
                }
            }
        }

        if completed < self.cfg.min_trials as usize {
            Ok(Summary::Incomplete { records })
        } else {
            Ok(Summary::Complete {
                records,
                confirmation: confirmation_token(participant_id, secret),
            })
        }
    }

    /// Back to trial 0, naive, empty logs. The task stays loaded.
    pub fn reset(&mut self) {
        self.current_trial = 0;
        self.current_state = None;
        self.trial_log.clear();
        self.response_log.clear();
        self.cumulative_points = 0;
    }
}

fn payoff(task: &TaskDefinition, state: usize) -> Reward {
    task.state_labels[state] as Reward * PAYOFF_SCALE
}

fn response_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskCatalog;

    fn two_state_task() -> Arc<TaskDefinition> {
        Arc::new(TaskDefinition::new(vec![1, 3], vec![[0, 1], [1, 0]]).unwrap())
    }

    fn cfg(naive: u32, max: u32, min: u32) -> EngineConfig {
        EngineConfig { max_trials: max, min_trials: min, naive_trials: naive, debug: false }
    }

    fn engine(naive: u32, max: u32, min: u32) -> TrialEngine {
        TrialEngine::with_task(7, Some(two_state_task()), cfg(naive, max, min))
    }

    fn options(engine: &mut TrialEngine) -> TrialOptions {
        match engine.get_next_options() {
            Some(NextTrial::Options(opts)) => opts,
            other => panic!("expected options, got {:?}", other),
        }
    }

    struct BrokenSource;

    impl TaskSource for BrokenSource {
        fn task(&self, _id: TaskId) -> anyhow::Result<Option<Arc<TaskDefinition>>> {
            Err(anyhow::anyhow!("database offline"))
        }
    }

    #[test]
    fn test_unknown_task_is_not_ready() {
        let catalog = TaskCatalog::from_tasks([(1, TaskDefinition::new(vec![1], vec![[0, 0]]).unwrap())]).unwrap();
        let mut engine = TrialEngine::new(99, &catalog, cfg(2, 5, 2));
        assert!(!engine.is_ready());
        assert!(engine.get_next_options().is_none());
        assert!(engine.respond(Choice::A).is_none());
        engine.record_response(Choice::A, 100);
        assert_eq!(engine.current_trial(), 0);
        assert_eq!(engine.cumulative_points(), 0);
        assert_eq!(engine.summarize_for_persistence("p", "s"), Ok(Summary::NoTrials));
    }

    #[test]
    fn test_unavailable_source_is_not_ready() {
        let engine = TrialEngine::new(1, &BrokenSource, cfg(2, 5, 2));
        assert!(!engine.is_ready());
    }

    struct RawSource(TaskDefinition);

    impl TaskSource for RawSource {
        fn task(&self, _id: TaskId) -> anyhow::Result<Option<Arc<TaskDefinition>>> {
            Ok(Some(Arc::new(self.0.clone())))
        }
    }

    #[test]
    fn test_malformed_graph_is_not_ready() {
        // built field by field, so nothing validated it
        let source = RawSource(TaskDefinition { state_labels: vec![1], state_transitions: vec![[0, 5]] });
        let mut engine = TrialEngine::new(1, &source, cfg(1, 5, 1));
        assert!(!engine.is_ready());
        assert!(engine.respond(Choice::A).is_none());
        assert!(engine.respond(Choice::B).is_none());
        engine.update_state(Choice::B);
        assert_eq!(engine.current_trial(), 0);
        assert_eq!(engine.current_state(), None);
    }

    #[test]
    fn test_invalid_policy_is_not_ready() {
        let engine = TrialEngine::with_task(1, Some(two_state_task()), cfg(0, 5, 2));
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_naive_phase_pays_nothing() {
        let mut engine = engine(4, 10, 2);
        for trial in 0..3 {
            let opts = options(&mut engine);
            assert_eq!(opts, TrialOptions { reward_a: 0, reward_b: 0 });
            assert_eq!(engine.trial_log()[trial].target_a, None);
            engine.record_response(Choice::B, 0);
            assert_eq!(engine.current_state(), None);
        }
        // last naive trial points into the entry state
        let opts = options(&mut engine);
        assert_eq!(opts, TrialOptions { reward_a: 0, reward_b: 0 });
        assert_eq!(engine.trial_log()[3].target_a, Some(ENTRY_STATE));
        assert_eq!(engine.trial_log()[3].target_b, Some(ENTRY_STATE));
        engine.record_response(Choice::B, 0);
        assert_eq!(engine.current_state(), Some(ENTRY_STATE));
    }

    #[test]
    fn test_preview_is_idempotent() {
        let mut engine = engine(1, 10, 2);
        engine.respond(Choice::A);
        let first = engine.get_next_options();
        let second = engine.get_next_options();
        assert_eq!(first, second);
        assert_eq!(first, Some(NextTrial::Options(TrialOptions { reward_a: 100, reward_b: 300 })));
        assert_eq!(engine.trial_log().len(), 2);
        assert_eq!(engine.trial_log()[1].trial, 1);
    }

    #[test]
    fn test_update_state_phases() {
        let mut engine = engine(2, 10, 2);
        engine.update_state(Choice::B);
        assert_eq!(engine.current_state(), None);

        engine.current_trial = 2;
        engine.update_state(Choice::B);
        assert_eq!(engine.current_state(), Some(0));

        engine.current_trial = 3;
        engine.update_state(Choice::B);
        assert_eq!(engine.current_state(), Some(1));
        engine.current_trial = 4;
        engine.update_state(Choice::A);
        assert_eq!(engine.current_state(), Some(1));
        engine.update_state(Choice::B);
        assert_eq!(engine.current_state(), Some(0));
    }

    #[test]
    fn test_record_response_advances_by_one() {
        let mut engine = engine(1, 10, 2);
        for _ in 0..6 {
            let before_trial = engine.current_trial();
            let before_points = engine.cumulative_points();
            engine.respond(Choice::B);
            assert_eq!(engine.current_trial(), before_trial + 1);
            assert!(engine.cumulative_points() >= before_points);
        }
        assert_eq!(engine.trial_log().len(), engine.response_log().len());
    }

    #[test]
    fn test_stops_at_max_trials() {
        let mut engine = engine(1, 3, 1);
        for _ in 0..3 {
            assert!(engine.respond(Choice::A).is_some());
        }
        let logged = engine.trial_log().len();
        assert_eq!(engine.get_next_options(), Some(NextTrial::Finished));
        assert_eq!(engine.respond(Choice::A), None);
        assert_eq!(engine.trial_log().len(), logged);
        assert_eq!(engine.current_trial(), 3);
    }

    #[test]
    fn test_summary_thresholds() {
        let mut engine = engine(1, 10, 3);
        assert_eq!(engine.summarize_for_persistence("p", "s"), Ok(Summary::NoTrials));

        engine.respond(Choice::A);
        engine.respond(Choice::B);
        let summary = engine.summarize_for_persistence("p", "s").unwrap();
        assert!(matches!(summary, Summary::Incomplete { ref records } if records.len() == 2));

        engine.respond(Choice::B);
        let summary = engine.summarize_for_persistence("p", "s").unwrap();
        match summary {
            Summary::Complete { records, confirmation } => {
                assert_eq!(records.len(), 3);
                assert_eq!(confirmation, confirmation_token("p", "s"));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn test_summary_rejects_desync() {
        let mut engine = engine(1, 10, 1);
        engine.respond(Choice::A);
        // a response without a preview leaves the trial log behind
        engine.record_response(Choice::A, 0);
        let err = engine.summarize_for_persistence("p", "s").unwrap_err();
        assert_eq!(err, LogDesync { index: 1, trial_log: None, response_log: 1 });
    }

    #[test]
    fn test_summary_debug_fields() {
        let mut engine = TrialEngine::with_task(
            7,
            Some(two_state_task()),
            EngineConfig { debug: true, ..cfg(1, 10, 1) },
        );
        engine.respond(Choice::A);
        engine.respond(Choice::B);
        let summary = engine.summarize_for_persistence("p", "s").unwrap();
        let records = summary.records();
        let naive = records[0].debug.unwrap();
        assert!(naive.naive);
        assert_eq!((naive.state_a, naive.state_b), (0, 0));
        let entered = records[1].debug.unwrap();
        assert!(!entered.naive);
        assert_eq!((entered.reward_a, entered.reward_b), (100, 300));
        assert_eq!(records[1].reward, 300);
    }

    #[test]
    fn test_reset_keeps_task() {
        let mut engine = engine(1, 10, 1);
        engine.respond(Choice::A);
        engine.respond(Choice::B);
        engine.reset();
        assert!(engine.is_ready());
        assert_eq!(engine.current_trial(), 0);
        assert_eq!(engine.current_state(), None);
        assert!(engine.trial_log().is_empty());
        assert!(engine.response_log().is_empty());
        assert_eq!(engine.cumulative_points(), 0);
        assert!(engine.get_next_options().is_some());
    }

    #[test]
    fn test_response_time_is_local_wall_clock() {
        let mut engine = engine(1, 10, 1);
        engine.respond(Choice::A);
        let stamped = chrono::NaiveDateTime::parse_from_str(&engine.response_log()[0].time, "%Y-%m-%d %H:%M:%S")
            .unwrap();
        let drift = chrono::Local::now().naive_local() - stamped;
        assert!(drift.num_seconds().abs() <= 60);
    }

    #[test]
    fn test_choice_parsing() {
        assert_eq!("A".parse::<Choice>(), Ok(Choice::A));
        assert_eq!("b".parse::<Choice>(), Ok(Choice::B));
        assert!("C".parse::<Choice>().is_err());
        assert!("".parse::<Choice>().is_err());
    }
}
