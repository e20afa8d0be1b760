use serde_json::{json, Value};

fn u32_field(body: &Value, key: &str) -> u32 {
    body.get(key).and_then(|v| v.as_u64()).unwrap_or(0) as u32
}

fn value_field(body: &Value, key: &str) -> Value {
    body.get(key).cloned().unwrap_or(Value::Null)
}

/// One invocable {tool, mode} pair with its typed arguments.
///
/// Session handlers construct variants directly; workflow steps go through
/// [`ToolCall::resolve`], so both paths share the same exhaustive set and
/// adding a tool is a compile-checked extension, not a stringly-typed one.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    /// Curriculum planner: seed the week's learning objectives.
    CloBeginWeek { week: u32 },
    /// Curriculum planner: produce one day's lesson plan.
    CloPlanDay { week: u32, day: u32 },
    /// Curriculum planner: fold the learner's journal into the plan.
    CloReflect { week: u32, day: u32, journal: Value },
    /// Lecture delivery from a day plan.
    LecturerDeliver { plan: Value },
    /// Teaching assistant: materials for the whole week.
    TaGenerateWeek { week: u32, plan: Value },
    /// Teaching assistant: knowledge check for a delivered lecture.
    TaGenerateCheck { lecture: Value },
    /// Teaching assistant: score submitted check answers.
    TaReviewCheck { check: Value, answers: Value },
    /// Teaching assistant: structured exercise set.
    TaGenerateExercises { plan: Value },
    /// Teaching assistant: review a finished practice submission.
    TaReviewPractice { practice: Value, submission: Value },
    /// Socratic dialogue: seed question bank for the week.
    SocraticSeed { week: u32, plan: Value },
    /// Socratic dialogue: prepare a guided session from a day plan.
    SocraticPrepare { plan: Value },
    /// Code grader: provision a coding workspace.
    GraderPrepareWorkspace { plan: Value },
    /// Content ingest for branded course material.
    BrandIngest { week: u32, sources: Value },
}

impl ToolCall {
    /// Registry name of the tool this call targets.
    pub fn tool(&self) -> &'static str {
        match self {
            ToolCall::CloBeginWeek { .. }
            | ToolCall::CloPlanDay { .. }
            | ToolCall::CloReflect { .. } => "clo",
            ToolCall::LecturerDeliver { .. } => "lecturer",
            ToolCall::TaGenerateWeek { .. }
            | ToolCall::TaGenerateCheck { .. }
            | ToolCall::TaReviewCheck { .. }
            | ToolCall::TaGenerateExercises { .. }
            | ToolCall::TaReviewPractice { .. } => "ta",
            ToolCall::SocraticSeed { .. } | ToolCall::SocraticPrepare { .. } => "socratic",
            ToolCall::GraderPrepareWorkspace { .. } => "grader",
            ToolCall::BrandIngest { .. } => "brand",
        }
    }

    /// Mode/action string sent on the wire.
    pub fn mode(&self) -> &'static str {
        match self {
            ToolCall::CloBeginWeek { .. } => "begin_week",
            ToolCall::CloPlanDay { .. } => "plan_day",
            ToolCall::CloReflect { .. } => "reflect",
            ToolCall::LecturerDeliver { .. } => "deliver",
            ToolCall::TaGenerateWeek { .. } => "generate_week",
            ToolCall::TaGenerateCheck { .. } => "generate_check",
            ToolCall::TaReviewCheck { .. } => "review_check",
            ToolCall::TaGenerateExercises { .. } => "generate_exercises",
            ToolCall::TaReviewPractice { .. } => "review_practice",
            ToolCall::SocraticSeed { .. } => "seed",
            ToolCall::SocraticPrepare { .. } => "prepare",
            ToolCall::GraderPrepareWorkspace { .. } => "prepare_workspace",
            ToolCall::BrandIngest { .. } => "ingest",
        }
    }

    /// Call payload as sent to the reasoning service.
    pub fn payload(&self) -> Value {
        match self {
            ToolCall::CloBeginWeek { week } => json!({ "week": week }),
            ToolCall::CloPlanDay { week, day } => json!({ "week": week, "day": day }),
            ToolCall::CloReflect { week, day, journal } => {
                json!({ "week": week, "day": day, "journal": journal })
            }
            ToolCall::LecturerDeliver { plan } => json!({ "plan": plan }),
            ToolCall::TaGenerateWeek { week, plan } => json!({ "week": week, "plan": plan }),
            ToolCall::TaGenerateCheck { lecture } => json!({ "lecture": lecture }),
            ToolCall::TaReviewCheck { check, answers } => {
                json!({ "check": check, "answers": answers })
            }
            ToolCall::TaGenerateExercises { plan } => json!({ "plan": plan }),
            ToolCall::TaReviewPractice {
                practice,
                submission,
            } => json!({ "practice": practice, "submission": submission }),
            ToolCall::SocraticSeed { week, plan } => json!({ "week": week, "plan": plan }),
            ToolCall::SocraticPrepare { plan } => json!({ "plan": plan }),
            ToolCall::GraderPrepareWorkspace { plan } => json!({ "plan": plan }),
            ToolCall::BrandIngest { week, sources } => {
                json!({ "week": week, "sources": sources })
            }
        }
    }

    /// Reconstruct a call from the stringly shape workflow steps are
    /// defined in. Returns None for an unknown {tool, mode} pair.
    pub fn resolve(tool: &str, mode: &str, body: &Value) -> Option<ToolCall> {
        let call = match (tool, mode) {
            ("clo", "begin_week") => ToolCall::CloBeginWeek {
                week: u32_field(body, "week"),
            },
            ("clo", "plan_day") => ToolCall::CloPlanDay {
                week: u32_field(body, "week"),
                day: u32_field(body, "day"),
            },
            ("clo", "reflect") => ToolCall::CloReflect {
                week: u32_field(body, "week"),
                day: u32_field(body, "day"),
                journal: value_field(body, "journal"),
            },
            ("lecturer", "deliver") => ToolCall::LecturerDeliver {
                plan: value_field(body, "plan"),
            },
            ("ta", "generate_week") => ToolCall::TaGenerateWeek {
                week: u32_field(body, "week"),
                plan: value_field(body, "plan"),
            },
            ("ta", "generate_check") => ToolCall::TaGenerateCheck {
                lecture: value_field(body, "lecture"),
            },
            ("ta", "review_check") => ToolCall::TaReviewCheck {
                check: value_field(body, "check"),
                answers: value_field(body, "answers"),
            },
            ("ta", "generate_exercises") => ToolCall::TaGenerateExercises {
                plan: value_field(body, "plan"),
            },
            ("ta", "review_practice") => ToolCall::TaReviewPractice {
                practice: value_field(body, "practice"),
                submission: value_field(body, "submission"),
            },
            ("socratic", "seed") => ToolCall::SocraticSeed {
                week: u32_field(body, "week"),
                plan: value_field(body, "plan"),
            },
            ("socratic", "prepare") => ToolCall::SocraticPrepare {
                plan: value_field(body, "plan"),
            },
            ("grader", "prepare_workspace") => ToolCall::GraderPrepareWorkspace {
                plan: value_field(body, "plan"),
            },
            ("brand", "ingest") => ToolCall::BrandIngest {
                week: u32_field(body, "week"),
                sources: value_field(body, "sources"),
            },
            _ => return None,
        };
        Some(call)
    }
}
