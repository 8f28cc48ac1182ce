use crate::engine::{Reward, TrialEngine};
use crate::task::TaskDefinition;

#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub msg: String,
}

/// Completed trials must appear at the same index in both logs. The trial
/// log may hold one extra entry for a previewed, unanswered trial.
pub fn assert_logs_in_lockstep(engine: &TrialEngine) -> Result<(), InvariantViolation> {
    let offers = engine.trial_log();
    let responses = engine.response_log();
    if offers.len() < responses.len() || offers.len() > responses.len() + 1 {
        return Err(InvariantViolation {
            msg: format!(
                "trial log has {} entries for {} responses",
                offers.len(),
                responses.len()
            ),
        });
    }
    for (i, (offer, response)) in offers.iter().zip(responses).enumerate() {
        if offer.trial != response.trial || offer.trial as usize != i {
            return Err(InvariantViolation {
                msg: format!(
                    "index {}: offer trial {} vs response trial {}",
                    i, offer.trial, response.trial
                ),
            });
        }
    }
    Ok(())
}

pub fn assert_points_consistent(engine: &TrialEngine) -> Result<(), InvariantViolation> {
    let banked: Reward = engine.response_log().iter().map(|r| r.reward).sum();
    if banked != engine.cumulative_points() {
        return Err(InvariantViolation {
            msg: format!(
                "cumulative points {} differ from logged rewards {}",
                engine.cumulative_points(),
                banked
            ),
        });
    }
    if engine.current_trial() as usize != engine.response_log().len() {
        return Err(InvariantViolation {
            msg: "trial counter out of step with responses".to_string(),
        });
    }
    Ok(())
}

/// Naive before the entry trial, a valid graph state after it.
pub fn assert_state_valid(engine: &TrialEngine, task: &TaskDefinition) -> Result<(), InvariantViolation> {
    let naive = engine.config().naive_trials;
    match engine.current_state() {
        None if engine.current_trial() >= naive => Err(InvariantViolation {
            msg: format!("still naive at trial {}", engine.current_trial()),
        }),
        Some(_) if engine.current_trial() < naive => Err(InvariantViolation {
            msg: format!("entered graph early at trial {}", engine.current_trial()),
        }),
        Some(state) if state >= task.n_states() => Err(InvariantViolation {
            msg: format!("state {} outside graph of {}", state, task.n_states()),
        }),
        _ => Ok(()),
    }
}

pub fn check_all(engine: &TrialEngine, task: &TaskDefinition) -> Vec<InvariantViolation> {
    [
        assert_logs_in_lockstep(engine),
        assert_points_consistent(engine),
        assert_state_valid(engine, task),
    ]
    .into_iter()
    .filter_map(Result::err)
    .collect()
}
