//! Task definitions: the labeled reward graph behind one experiment variant.
//!
//! A task is a pair of parallel sequences. `state_labels[s]` is the payoff
//! value of state `s`; `state_transitions[s]` holds the next state for
//! option A and option B. The graph may contain cycles. Definitions are
//! validated once at load time and shared read-only between engines.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::logging::{log, obj, v_str, Domain, Level};
use serde_json::json;

pub type TaskId = u32;

/// Index of the state every participant enters after the naive phase.
pub const ENTRY_STATE: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub state_labels: Vec<u32>,
    pub state_transitions: Vec<[usize; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    Empty,
    LengthMismatch { labels: usize, transitions: usize },
    TargetOutOfRange { state: usize, branch: usize, target: usize },
}

impl TaskDefinition {
    pub fn new(state_labels: Vec<u32>, state_transitions: Vec<[usize; 2]>) -> Result<Self, GraphError> {
        let def = Self { state_labels, state_transitions };
        def.validate()?;
        Ok(def)
    }

    pub fn n_states(&self) -> usize {
        self.state_labels.len()
    }

    /// Every state needs a label and a transition pair, and every target
    /// must name an existing state.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.state_labels.is_empty() {
            return Err(GraphError::Empty);
        }
        if self.state_labels.len() != self.state_transitions.len() {
            return Err(GraphError::LengthMismatch {
                labels: self.state_labels.len(),
                transitions: self.state_transitions.len(),
            });
        }
        let n = self.n_states();
        for (state, pair) in self.state_transitions.iter().enumerate() {
            for (branch, &target) in pair.iter().enumerate() {
                if target >= n {
                    return Err(GraphError::TargetOutOfRange { state, branch, target });
                }
            }
        }
        Ok(())
    }

    /// States reachable from the entry state, in ascending order.
    pub fn reachable_from_entry(&self) -> Vec<usize> {
        let mut seen = vec![false; self.n_states()];
        let mut queue = VecDeque::new();
        if let Some(first) = seen.get_mut(ENTRY_STATE) {
            *first = true;
            queue.push_back(ENTRY_STATE);
        }
        while let Some(state) = queue.pop_front() {
            let Some(pair) = self.state_transitions.get(state) else {
                continue;
            };
            for &next in pair {
                if let Some(flag) = seen.get_mut(next) {
                    if !*flag {
                        *flag = true;
                        queue.push_back(next);
                    }
                }
            }
        }
        seen.iter()
            .enumerate()
            .filter(|(_, &hit)| hit)
            .map(|(s, _)| s)
            .collect()
    }

    pub fn max_label(&self) -> u32 {
        self.state_labels.iter().copied().max().unwrap_or(0)
    }
}

/// Keyed lookup of task definitions.
///
/// `Err` means the source itself is unavailable, `Ok(None)` that the id is unknown.
pub trait TaskSource {
    fn task(&self, id: TaskId) -> Result<Option<Arc<TaskDefinition>>>;
}

/// All task definitions of one catalog file, loaded once.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<TaskId, Arc<TaskDefinition>>,
    digest: String,
}

impl TaskCatalog {
    /// Load a JSON catalog of the form `{"<id>": {"state_labels": [..], "state_transitions": [[a, b], ..]}}`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading task catalog {}", path.display()))?;
        let raw: HashMap<String, TaskDefinition> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing task catalog {}", path.display()))?;

        let mut tasks = BTreeMap::new();
        for (key, def) in raw {
            let id: TaskId = key
                .trim()
                .parse()
                .map_err(|_| anyhow!("task id {:?} is not an integer", key))?;
            def.validate()
                .map_err(|err| anyhow!("task {} is malformed: {:?}", id, err))?;
            tasks.insert(id, Arc::new(def));
        }

        let catalog = Self { tasks, digest: hex::encode(Sha256::digest(&bytes)) };
        log(
            Level::Info,
            Domain::Task,
            "catalog_loaded",
            obj(&[
                ("path", v_str(&path.to_string_lossy())),
                ("tasks", json!(catalog.tasks.len())),
                ("sha256", v_str(&catalog.digest)),
            ]),
        );
        Ok(catalog)
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = (TaskId, TaskDefinition)>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (id, def) in tasks {
            def.validate()
                .map_err(|err| anyhow!("task {} is malformed: {:?}", id, err))?;
            map.insert(id, Arc::new(def));
        }
        Ok(Self { tasks: map, digest: String::new() })
    }

    /// SHA-256 of the catalog file, empty for in-memory catalogs.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &TaskDefinition)> {
        self.tasks.iter().map(|(id, def)| (*id, def.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskSource for TaskCatalog {
    fn task(&self, id: TaskId) -> Result<Option<Arc<TaskDefinition>>> {
        Ok(self.tasks.get(&id).cloned())
    }
}
