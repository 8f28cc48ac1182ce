//! JSON endpoints over the session registry.
//!
//! Endpoints:
//!   GET /api/health
//!   GET /api/login?uid=..          start or resume a session
//!   GET /api/generate_id           issue a fresh participant id
//!   GET /api/trial?uid=..          options for the current trial
//!   GET /api/respond?uid=..&side=left|right
//!   GET /api/progress?uid=..       points, trial, winnings
//!   GET /api/finish?uid=..         flush and end the session
//!   GET /api/download              every stored row as CSV
//!   GET /api/debug
//!
//! Requests are handled one at a time; the caller owns the socket.

use rand::rngs::StdRng;
use serde_json::{json, Value};
use std::collections::HashMap;
use url::Url;

use crate::engine::{NextTrial, TrialOptions};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::participant::{generate_uid, is_valid_uid};
use crate::session::{FinishOutcome, SessionRegistry, StartOutcome};
use crate::storage::TrialSink;
use crate::task::TaskCatalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn json(status: &'static str, body: Value) -> Self {
        Self { status, content_type: "application/json", body: body.to_string() }
    }

    fn ok(body: Value) -> Self {
        Self::json("200 OK", body)
    }

    fn error(status: &'static str, msg: &str) -> Self {
        Self::json(status, json!({ "error": msg }))
    }

    pub fn to_http(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\r\n{}",
            self.status,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// Screen side of a response. A is always shown on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "left" => Some(Side::Left),
            "right" => Some(Side::Right),
            _ => None,
        }
    }

    fn pick(self, options: &TrialOptions) -> crate::engine::Choice {
        match self {
            Side::Left => options.left().0,
            Side::Right => options.right().0,
        }
    }
}

pub struct Server<S: TrialSink> {
    registry: SessionRegistry,
    catalog: TaskCatalog,
    sink: S,
    rng: StdRng,
}

impl<S: TrialSink> Server<S> {
    pub fn new(registry: SessionRegistry, catalog: TaskCatalog, sink: S, rng: StdRng) -> Self {
        Self { registry, catalog, sink, rng }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handle one request line such as `GET /api/trial?uid=abc HTTP/1.1`.
    pub fn handle(&mut self, request_line: &str) -> Response {
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Response::error("400 BAD REQUEST", "malformed request line");
        };
        if method != "GET" {
            return Response::error("405 METHOD NOT ALLOWED", "only GET is supported");
        }
        let Ok(url) = Url::parse(&format!("http://localhost{}", target)) else {
            return Response::error("400 BAD REQUEST", "malformed target");
        };
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let response = match url.path() {
            "/api/health" => Response::ok(json!({ "status": "ok", "sessions": self.registry.len() })),
            "/api/login" => self.login(&query),
            "/api/generate_id" => self.generate_id(),
            "/api/trial" => self.trial(&query),
            "/api/respond" => self.respond(&query),
            "/api/progress" => self.progress(&query),
            "/api/finish" => self.finish(&query),
            "/api/download" => self.download(),
            "/api/debug" => Response::ok(json!({ "debug": self.registry.config().debug })),
            _ => Response::error("404 NOT FOUND", "not found"),
        };
        log(
            Level::Debug,
            Domain::System,
            "request",
            obj(&[("path", v_str(url.path())), ("status", v_str(response.status))]),
        );
        response
    }

    fn session_uid<'a>(&self, query: &'a HashMap<String, String>) -> Result<&'a str, Response> {
        let uid = query.get("uid").map(String::as_str).unwrap_or("");
        if self.registry.contains(uid) {
            Ok(uid)
        } else {
            Err(Response::error("401 UNAUTHORIZED", "no active session, log in first"))
        }
    }

    fn login(&mut self, query: &HashMap<String, String>) -> Response {
        let uid = query.get("uid").map(String::as_str).unwrap_or("");
        if !is_valid_uid(uid) {
            return Response::error("400 BAD REQUEST", "the uid you provided is not valid");
        }
        let cfg = self.registry.config();
        let (min_trials, max_trials) = (cfg.min_trials, cfg.max_trials);
        match self.registry.start(uid, &self.catalog, &self.sink, &mut self.rng) {
            Ok(StartOutcome::Started { .. }) => Response::ok(json!({
                "status": "started", "min_trials": min_trials, "max_trials": max_trials,
            })),
            Ok(StartOutcome::Resumed { .. }) => Response::ok(json!({
                "status": "resumed", "min_trials": min_trials, "max_trials": max_trials,
            })),
            Ok(StartOutcome::NoTasks) => Response::ok(json!({ "status": "no_tasks" })),
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Session,
                    "start_failed",
                    obj(&[("participant", v_str(uid)), ("error", v_str(&format!("{err:#}")))]),
                );
                Response::error("500 INTERNAL SERVER ERROR", "could not start a session")
            }
        }
    }

    fn generate_id(&mut self) -> Response {
        match self.sink.destinations() {
            Ok(destinations) => Response::ok(json!({ "uid": generate_uid(&mut self.rng, &destinations) })),
            Err(err) => Response::error("500 INTERNAL SERVER ERROR", &format!("{err:#}")),
        }
    }

    fn trial(&mut self, query: &HashMap<String, String>) -> Response {
        let uid = match self.session_uid(query) {
            Ok(uid) => uid,
            Err(resp) => return resp,
        };
        let Some(engine) = self.registry.engine_mut(uid) else {
            return Response::error("401 UNAUTHORIZED", "no active session, log in first");
        };
        match engine.get_next_options() {
            Some(NextTrial::Options(options)) => {
                let (left, left_reward) = options.left();
                let (right, right_reward) = options.right();
                Response::ok(json!({
                    "trial": engine.current_trial(),
                    "left": left.as_str(),
                    "left_reward": left_reward,
                    "right": right.as_str(),
                    "right_reward": right_reward,
                }))
            }
            Some(NextTrial::Finished) => Response::ok(json!({ "finished": true })),
            None => Response::error("500 INTERNAL SERVER ERROR", "task not loaded"),
        }
    }

    fn respond(&mut self, query: &HashMap<String, String>) -> Response {
        let uid = match self.session_uid(query) {
            Ok(uid) => uid,
            Err(resp) => return resp,
        };
        let Some(side) = query.get("side").and_then(|s| Side::parse(s)) else {
            return Response::error("400 BAD REQUEST", "side must be left or right");
        };
        let Some(engine) = self.registry.engine_mut(uid) else {
            return Response::error("401 UNAUTHORIZED", "no active session, log in first");
        };
        let options = match engine.get_next_options() {
            Some(NextTrial::Options(options)) => options,
            Some(NextTrial::Finished) => return Response::ok(json!({ "finished": true })),
            None => return Response::error("500 INTERNAL SERVER ERROR", "task not loaded"),
        };
        let choice = side.pick(&options);
        let reward = options.reward_for(choice);
        engine.record_response(choice, reward);
        Response::ok(json!({ "success": true, "choice": choice.as_str(), "reward": reward }))
    }

    fn progress(&mut self, query: &HashMap<String, String>) -> Response {
        let uid = match self.session_uid(query) {
            Ok(uid) => uid,
            Err(resp) => return resp,
        };
        match self.registry.progress(uid) {
            Some(progress) => Response::ok(json!(progress)),
            None => Response::error("401 UNAUTHORIZED", "no active session, log in first"),
        }
    }

    fn finish(&mut self, query: &HashMap<String, String>) -> Response {
        let uid = match self.session_uid(query) {
            Ok(uid) => uid,
            Err(resp) => return resp,
        };
        match self.registry.finish(uid, &mut self.sink) {
            Ok(FinishOutcome::Confirmed { confirmation, .. }) => Response::ok(json!({
                "status": "confirmed", "uid": uid, "confirmation": confirmation,
            })),
            Ok(outcome) => Response::ok(json!({ "status": outcome.status(), "uid": uid })),
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Session,
                    "finish_failed",
                    obj(&[("participant", v_str(uid)), ("error", v_str(&format!("{err:#}")))]),
                );
                Response::error("500 INTERNAL SERVER ERROR", "could not record your trials")
            }
        }
    }

    fn download(&self) -> Response {
        match self.sink.export_csv() {
            Ok(csv) => Response { status: "200 OK", content_type: "text/csv", body: csv },
            Err(err) => Response::error("500 INTERNAL SERVER ERROR", &format!("{err:#}")),
        }
    }
}
