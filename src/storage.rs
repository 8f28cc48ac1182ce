use anyhow::Result;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::BTreeMap;

use crate::engine::{Choice, ExportRecord};
use crate::engine::records::DebugFields;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::task::TaskId;

/// Durable home for finished sessions. Each destination holds the rows of
/// one participant/task attempt.
pub trait TrialSink {
    fn insert_many(&mut self, destination: &str, records: &[ExportRecord]) -> Result<()>;
    fn destinations(&self) -> Result<Vec<String>>;
    fn records(&self, destination: &str) -> Result<Vec<ExportRecord>>;

    /// Every stored row as CSV, with its destination as the last column.
    fn export_csv(&self) -> Result<String> {
        let mut rows = Vec::new();
        for destination in self.destinations()? {
            for record in self.records(&destination)? {
                rows.push((destination.clone(), record));
            }
        }
        Ok(render_csv(&rows))
    }
}

pub fn destination_name(participant: &str, task_id: TaskId, complete: bool) -> String {
    if complete {
        format!("{}_{}", participant, task_id)
    } else {
        format!("{}_{}_incomplete", participant, task_id)
    }
}

/// Tasks this participant already attempted, finished or not.
pub fn played_tasks(participant: &str, destinations: &[String]) -> Vec<TaskId> {
    destinations
        .iter()
        .filter_map(|d| {
            let mut parts = d.split('_');
            if parts.next()? != participant {
                return None;
            }
            parts.next()?.parse().ok()
        })
        .collect()
}

pub fn valid_tasks(participant: &str, all: &[TaskId], destinations: &[String]) -> Vec<TaskId> {
    let played = played_tasks(participant, destinations);
    all.iter().copied().filter(|id| !played.contains(id)).collect()
}

pub const CSV_HEADER: &str =
    "trial,state,response,reward,time,state_a,state_b,reward_a,reward_b,naive,destination";

pub fn render_csv(rows: &[(String, ExportRecord)]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for (destination, r) in rows {
        let debug = match &r.debug {
            Some(d) => format!("{},{},{},{},{}", d.state_a, d.state_b, d.reward_a, d.reward_b, d.naive),
            None => ",,,,".to_string(),
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            r.trial,
            r.state,
            r.response.as_str(),
            r.reward,
            r.time,
            debug,
            destination
        ));
    }
    out
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS trials (
                destination TEXT NOT NULL,
                trial INTEGER NOT NULL,
                state INTEGER NOT NULL,
                response TEXT NOT NULL,
                reward INTEGER NOT NULL,
                time TEXT NOT NULL,
                state_a INTEGER,
                state_b INTEGER,
                reward_a INTEGER,
                reward_b INTEGER,
                naive INTEGER
            );
            CREATE INDEX IF NOT EXISTS trials_destination ON trials (destination, trial);
            COMMIT;",
        )?;
        Ok(())
    }
}

impl TrialSink for SqliteStore {
    fn insert_many(&mut self, destination: &str, records: &[ExportRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for r in records {
            let d = r.debug.as_ref();
            tx.execute(
                "INSERT INTO trials (destination, trial, state, response, reward, time,
                                     state_a, state_b, reward_a, reward_b, naive)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    destination,
                    r.trial as i64,
                    r.state,
                    r.response.as_str(),
                    r.reward as i64,
                    r.time,
                    d.map(|d| d.state_a),
                    d.map(|d| d.state_b),
                    d.map(|d| d.reward_a as i64),
                    d.map(|d| d.reward_b as i64),
                    d.map(|d| d.naive),
                ],
            )?;
        }
        tx.commit()?;
        log(
            Level::Info,
            Domain::Storage,
            "rows_written",
            obj(&[("destination", v_str(destination)), ("rows", json!(records.len()))]),
        );
        Ok(())
    }

    fn destinations(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT destination FROM trials ORDER BY destination")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn records(&self, destination: &str) -> Result<Vec<ExportRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT trial, state, response, reward, time, state_a, state_b, reward_a, reward_b, naive
             FROM trials WHERE destination = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![destination], |row| {
            let response: String = row.get(2)?;
            let state_a: Option<i64> = row.get(5)?;
            let state_b: Option<i64> = row.get(6)?;
            let reward_a: Option<i64> = row.get(7)?;
            let reward_b: Option<i64> = row.get(8)?;
            let naive: Option<bool> = row.get(9)?;
            let debug = match (state_a, state_b, reward_a, reward_b, naive) {
                (Some(state_a), Some(state_b), Some(reward_a), Some(reward_b), Some(naive)) => {
                    Some(DebugFields {
                        state_a,
                        state_b,
                        reward_a: reward_a as u64,
                        reward_b: reward_b as u64,
                        naive,
                    })
                }
                _ => None,
            };
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                response,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                debug,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (trial, state, response, reward, time, debug) = row?;
            let response: Choice = response
                .parse()
                .map_err(|e: String| anyhow::anyhow!("row {} of {}: {}", trial, destination, e))?;
            out.push(ExportRecord {
                trial: trial as u32,
                state,
                response,
                reward: reward as u64,
                time,
                debug,
            });
        }
        Ok(out)
    }
}

/// Keeps everything in process; used by dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, Vec<ExportRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrialSink for MemorySink {
    fn insert_many(&mut self, destination: &str, records: &[ExportRecord]) -> Result<()> {
        self.tables
            .entry(destination.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    fn destinations(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn records(&self, destination: &str) -> Result<Vec<ExportRecord>> {
        Ok(self.tables.get(destination).cloned().unwrap_or_default())
    }
}
