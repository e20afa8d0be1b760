use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::storage::Store;
use crate::tools::{parse_tool_result, CallOptions, ToolCall, ToolError, ToolOutcome, ToolRegistry};

/// Phase outputs accumulated over a session. Append-only.
pub type Artifacts = HashMap<String, Value>;

/// One stage of the daily learning flow. Strictly ordered; a session only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Lecture,
    Check,
    PracticePrep,
    Practice,
    Reflect,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Lecture => "lecture",
            Phase::Check => "check",
            Phase::PracticePrep => "practice_prep",
            Phase::Practice => "practice",
            Phase::Reflect => "reflect",
            Phase::Completed => "completed",
        }
    }

    /// Position in the fixed phase order.
    pub fn index(&self) -> u8 {
        match self {
            Phase::Planning => 0,
            Phase::Lecture => 1,
            Phase::Check => 2,
            Phase::PracticePrep => 3,
            Phase::Practice => 4,
            Phase::Reflect => 5,
            Phase::Completed => 6,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Phase::Planning),
            "lecture" => Ok(Phase::Lecture),
            "check" => Ok(Phase::Check),
            "practice_prep" => Ok(Phase::PracticePrep),
            "practice" => Ok(Phase::Practice),
            "reflect" => Ok(Phase::Reflect),
            "completed" => Ok(Phase::Completed),
            other => anyhow::bail!("Invalid phase: {}", other),
        }
    }
}

/// User events driving phase transitions, in the order they are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    StartDay,
    LectureDone,
    CheckDone,
    PracticeReady,
    PracticeDone,
    ReflectDone,
}

impl SessionEvent {
    /// The phase a session must be in for this event to be valid.
    pub fn expected_phase(&self) -> Phase {
        match self {
            SessionEvent::StartDay => Phase::Planning,
            SessionEvent::LectureDone => Phase::Lecture,
            SessionEvent::CheckDone => Phase::Check,
            SessionEvent::PracticeReady => Phase::PracticePrep,
            SessionEvent::PracticeDone => Phase::Practice,
            SessionEvent::ReflectDone => Phase::Reflect,
        }
    }

    /// The phase a session advances to once this event is handled.
    pub fn next_phase(&self) -> Phase {
        match self {
            SessionEvent::StartDay => Phase::Lecture,
            SessionEvent::LectureDone => Phase::Check,
            SessionEvent::CheckDone => Phase::PracticePrep,
            SessionEvent::PracticeReady => Phase::Practice,
            SessionEvent::PracticeDone => Phase::Reflect,
            SessionEvent::ReflectDone => Phase::Completed,
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionEvent::StartDay => "start_day",
            SessionEvent::LectureDone => "lecture_done",
            SessionEvent::CheckDone => "check_done",
            SessionEvent::PracticeReady => "practice_ready",
            SessionEvent::PracticeDone => "practice_done",
            SessionEvent::ReflectDone => "reflect_done",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SessionEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_day" => Ok(SessionEvent::StartDay),
            "lecture_done" => Ok(SessionEvent::LectureDone),
            "check_done" => Ok(SessionEvent::CheckDone),
            "practice_ready" => Ok(SessionEvent::PracticeReady),
            "practice_done" => Ok(SessionEvent::PracticeDone),
            "reflect_done" => Ok(SessionEvent::ReflectDone),
            other => anyhow::bail!("Invalid session event: {}", other),
        }
    }
}

/// How the learner wants to practice. Only `practice_ready` branches on
/// this; every other handler has a fixed tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PracticeKind {
    Coding,
    Dialogue,
    Exercises,
}

impl PracticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PracticeKind::Coding => "coding",
            PracticeKind::Dialogue => "dialogue",
            PracticeKind::Exercises => "exercises",
        }
    }
}

impl FromStr for PracticeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(PracticeKind::Coding),
            "dialogue" => Ok(PracticeKind::Dialogue),
            "exercises" => Ok(PracticeKind::Exercises),
            other => anyhow::bail!("Invalid practice kind: {}", other),
        }
    }
}

/// One user's learning session for a given week and day.
///
/// `phase` advances monotonically; `artifacts` only grows. Sessions are
/// never deleted — they are the learner's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EducationSession {
    pub session_id: String,
    pub user_id: String,
    pub week: u32,
    pub day: u32,
    pub phase: Phase,
    pub artifacts: Artifacts,
    /// ETag of the freshest planner signal, for conditional re-fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EducationSession {
    /// Fresh session at the planning phase.
    pub fn new(user_id: &str, week: u32, day: u32) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            week,
            day,
            phase: Phase::Planning,
            artifacts: Artifacts::new(),
            etag: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The event is valid for a different phase than the session is in.
    #[error("event '{event}' is not valid in phase '{phase}'")]
    OutOfOrder { event: SessionEvent, phase: Phase },
    /// Another event for the same session is still being handled.
    #[error("session {user_id}/w{week}d{day} is already handling an event")]
    Busy {
        user_id: String,
        week: u32,
        day: u32,
    },
    /// Malformed or missing request data. Fail fast, no tool was called.
    #[error("{0}")]
    Validation(String),
    /// A tool call failed; returned verbatim. The phase did not advance,
    /// so retrying the same event is safe.
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a handled event returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct EventReply {
    pub phase: Phase,
    /// Absent when the upstream signal was unchanged and the cached
    /// artifact was reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Drives one user's daily learning flow through its phases.
///
/// Events for the same session are strictly sequential: a second event
/// arriving while one is in flight is rejected, because phase advancement
/// is not commutative. Different sessions proceed independently.
pub struct SessionManager {
    store: Arc<dyn Store>,
    registry: Arc<ToolRegistry>,
    in_flight: Mutex<HashSet<(String, u32, u32)>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            store,
            registry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Handle one session event for `(user_id, week, day)`.
    pub async fn handle_event(
        &self,
        user_id: &str,
        week: u32,
        day: u32,
        event: SessionEvent,
        payload: Value,
        etag_if_none_match: Option<String>,
    ) -> Result<EventReply, SessionError> {
        let _guard = self.acquire(user_id, week, day)?;

        let mut session = match self.store.get_session(user_id, week, day).await? {
            Some(s) => s,
            None => EducationSession::new(user_id, week, day),
        };

        if session.phase != event.expected_phase() {
            return Err(SessionError::OutOfOrder {
                event,
                phase: session.phase,
            });
        }

        let reply_data = match event {
            SessionEvent::StartDay => {
                self.start_day(&mut session, etag_if_none_match).await?
            }
            SessionEvent::LectureDone => self.lecture_done(&mut session).await?,
            SessionEvent::CheckDone => self.check_done(&mut session, &payload).await?,
            SessionEvent::PracticeReady => self.practice_ready(&mut session, &payload).await?,
            SessionEvent::PracticeDone => self.practice_done(&mut session, &payload).await?,
            SessionEvent::ReflectDone => self.reflect_done(&mut session, &payload).await?,
        };

        session.phase = event.next_phase();
        session.updated_at = Utc::now();
        self.store.upsert_session(&session).await?;

        info!(
            user = %user_id,
            week = week,
            day = day,
            event = %event,
            phase = %session.phase,
            "Session advanced"
        );

        Ok(EventReply {
            phase: session.phase,
            data: reply_data,
        })
    }

    fn acquire(&self, user_id: &str, week: u32, day: u32) -> Result<InFlightGuard<'_>, SessionError> {
        let key = (user_id.to_string(), week, day);
        let mut in_flight = self.in_flight.lock().unwrap();
        if !in_flight.insert(key.clone()) {
            return Err(SessionError::Busy {
                user_id: user_id.to_string(),
                week,
                day,
            });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            key,
        })
    }

    /// Planning → lecture. Two sequential calls: the lecture needs the
    /// plan. A failure between them leaves the plan artifact persisted —
    /// there is no rollback of the first call.
    async fn start_day(
        &self,
        session: &mut EducationSession,
        etag_if_none_match: Option<String>,
    ) -> Result<Option<Value>, SessionError> {
        let plan_call = ToolCall::CloPlanDay {
            week: session.week,
            day: session.day,
        };
        let opts = CallOptions {
            etag_if_none_match,
            ..CallOptions::default()
        };

        let plan = match self
            .registry
            .call(&session.user_id, &plan_call, opts)
            .await?
        {
            ToolOutcome::Fresh { data, etag } => {
                parse_tool_result(&data, &["topics"])?;
                session.artifacts.insert("plan".to_string(), data.clone());
                session.etag = etag;
                session.updated_at = Utc::now();
                self.store.upsert_session(session).await?;
                data
            }
            ToolOutcome::NotModified => session
                .artifacts
                .get("plan")
                .cloned()
                .ok_or_else(|| {
                    SessionError::Validation(
                        "planner reported no change but no cached plan exists".to_string(),
                    )
                })?,
        };

        let lecture_call = ToolCall::LecturerDeliver { plan: plan.clone() };
        let lecture = match self
            .registry
            .call(&session.user_id, &lecture_call, CallOptions::default())
            .await?
        {
            ToolOutcome::Fresh { data, .. } => data,
            ToolOutcome::NotModified => session
                .artifacts
                .get("lecture")
                .cloned()
                .unwrap_or(Value::Null),
        };
        session
            .artifacts
            .insert("lecture".to_string(), lecture.clone());

        Ok(Some(json!({ "plan": plan, "lecture": lecture })))
    }

    /// Lecture → check: generate the knowledge check for what was taught.
    async fn lecture_done(
        &self,
        session: &mut EducationSession,
    ) -> Result<Option<Value>, SessionError> {
        let lecture = self.artifact(session, "lecture")?;
        let call = ToolCall::TaGenerateCheck { lecture };

        let check = self.fresh(session, &call).await?;
        parse_tool_result(&check, &["questions"])?;
        session.artifacts.insert("check".to_string(), check.clone());

        Ok(Some(check))
    }

    /// Check → practice_prep: score the submitted answers.
    async fn check_done(
        &self,
        session: &mut EducationSession,
        payload: &Value,
    ) -> Result<Option<Value>, SessionError> {
        let answers = required_field(payload, "answers")?;
        let check = self.artifact(session, "check")?;
        let call = ToolCall::TaReviewCheck { check, answers };

        let result = self.fresh(session, &call).await?;
        session
            .artifacts
            .insert("check_result".to_string(), result.clone());

        Ok(Some(result))
    }

    /// Practice_prep → practice. The one payload-dependent branch: the
    /// practice kind picks the tool.
    async fn practice_ready(
        &self,
        session: &mut EducationSession,
        payload: &Value,
    ) -> Result<Option<Value>, SessionError> {
        let kind = payload
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SessionError::Validation("missing field 'kind'".to_string()))?;
        let kind = PracticeKind::from_str(kind)
            .map_err(|e| SessionError::Validation(e.to_string()))?;

        let plan = self.artifact(session, "plan")?;
        let call = match kind {
            PracticeKind::Coding => ToolCall::GraderPrepareWorkspace { plan },
            PracticeKind::Dialogue => ToolCall::SocraticPrepare { plan },
            PracticeKind::Exercises => ToolCall::TaGenerateExercises { plan },
        };

        let practice = self.fresh(session, &call).await?;
        session
            .artifacts
            .insert("practice".to_string(), practice.clone());
        session.artifacts.insert(
            "practice_kind".to_string(),
            Value::String(kind.as_str().to_string()),
        );

        Ok(Some(practice))
    }

    /// Practice → reflect: review the submission against the exercise.
    async fn practice_done(
        &self,
        session: &mut EducationSession,
        payload: &Value,
    ) -> Result<Option<Value>, SessionError> {
        let submission = required_field(payload, "submission")?;
        let practice = self.artifact(session, "practice")?;
        let call = ToolCall::TaReviewPractice {
            practice,
            submission,
        };

        let review = self.fresh(session, &call).await?;
        session
            .artifacts
            .insert("practice_review".to_string(), review.clone());

        Ok(Some(review))
    }

    /// Reflect → completed: fold the journal back into the curriculum.
    async fn reflect_done(
        &self,
        session: &mut EducationSession,
        payload: &Value,
    ) -> Result<Option<Value>, SessionError> {
        let journal = required_field(payload, "journal")?;
        let call = ToolCall::CloReflect {
            week: session.week,
            day: session.day,
            journal,
        };

        let reflection = self.fresh(session, &call).await?;
        session
            .artifacts
            .insert("reflection".to_string(), reflection.clone());

        Ok(Some(reflection))
    }

    async fn fresh(
        &self,
        session: &EducationSession,
        call: &ToolCall,
    ) -> Result<Value, SessionError> {
        match self
            .registry
            .call(&session.user_id, call, CallOptions::default())
            .await?
        {
            ToolOutcome::Fresh { data, .. } => Ok(data),
            // Without a conditional header this should not happen; treat
            // it as an upstream contract violation.
            ToolOutcome::NotModified => Err(SessionError::Tool(ToolError::Invalid(
                "unexpected not-modified response".to_string(),
            ))),
        }
    }

    fn artifact(
        &self,
        session: &EducationSession,
        key: &str,
    ) -> Result<Value, SessionError> {
        session.artifacts.get(key).cloned().ok_or_else(|| {
            SessionError::Validation(format!("session has no '{}' artifact yet", key))
        })
    }
}

fn required_field(payload: &Value, key: &str) -> Result<Value, SessionError> {
    payload
        .get(key)
        .cloned()
        .ok_or_else(|| SessionError::Validation(format!("missing field '{}'", key)))
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<(String, u32, u32)>>,
    key: (String, u32, u32),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}
