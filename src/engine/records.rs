//! Per-trial log records and the flat export built from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Choice, Reward};

/// What the participant was offered on one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: u32,
    /// State before the transition; `None` while naive
    pub state: Option<usize>,
    pub target_a: Option<usize>,
    pub target_b: Option<usize>,
    pub reward_a: Reward,
    pub reward_b: Reward,
}

impl TrialRecord {
    pub fn options(&self) -> TrialOptions {
        TrialOptions { reward_a: self.reward_a, reward_b: self.reward_b }
    }
}

/// What the participant picked on one trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub trial: u32,
    pub choice: Choice,
    pub reward: Reward,
    pub time: String,
}

/// Rewards on offer for the current trial. Option A is always shown on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialOptions {
    pub reward_a: Reward,
    pub reward_b: Reward,
}

impl TrialOptions {
    pub fn reward_for(&self, choice: Choice) -> Reward {
        match choice {
            Choice::A => self.reward_a,
            Choice::B => self.reward_b,
        }
    }

    pub fn left(&self) -> (Choice, Reward) {
        (Choice::A, self.reward_a)
    }

    pub fn right(&self) -> (Choice, Reward) {
        (Choice::B, self.reward_b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTrial {
    Options(TrialOptions),
    /// The trial cap is reached
    Finished,
}

/// Flat row handed to the persistence sink. States use -1 for naive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub trial: u32,
    pub state: i64,
    pub response: Choice,
    pub reward: Reward,
    pub time: String,
    #[serde(flatten)]
    pub debug: Option<DebugFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugFields {
    pub state_a: i64,
    pub state_b: i64,
    pub reward_a: Reward,
    pub reward_b: Reward,
    pub naive: bool,
}

pub fn state_code(state: Option<usize>) -> i64 {
    state.map(|s| s as i64).unwrap_or(-1)
}

impl ExportRecord {
    pub fn from_pair(offer: &TrialRecord, response: &ResponseRecord, debug: bool) -> Self {
        Self {
            trial: response.trial,
            state: state_code(offer.state),
            response: response.choice,
            reward: response.reward,
            time: response.time.clone(),
            debug: debug.then(|| DebugFields {
                state_a: state_code(offer.target_a),
                state_b: state_code(offer.target_b),
                reward_a: offer.reward_a,
                reward_b: offer.reward_b,
                naive: offer.state.is_none(),
            }),
        }
    }
}

/// The trial and response logs disagree at `index`; the export must not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDesync {
    pub index: usize,
    pub trial_log: Option<u32>,
    pub response_log: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Summary {
    NoTrials,
    /// Fewer than `min_trials` completed; still persisted
    Incomplete { records: Vec<ExportRecord> },
    Complete { records: Vec<ExportRecord>, confirmation: String },
}

impl Summary {
    pub fn records(&self) -> &[ExportRecord] {
        match self {
            Summary::NoTrials => &[],
            Summary::Incomplete { records } | Summary::Complete { records, .. } => records.as_slice(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Summary::Complete { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            Summary::NoTrials => "no_trials",
            Summary::Incomplete { .. } => "not_enough_trials",
            Summary::Complete { .. } => "confirmed",
        }
    }
}

/// Hex SHA-256 of `<participant>_<secret>`: a receipt that proves capture
/// without revealing the secret.
pub fn confirmation_token(participant_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(participant_id.as_bytes());
    hasher.update(b"_");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
