//! MQ-030: Event stream records. The wire contract every client observes.
//!
//! One JSON object per line, discriminated by `event` and wrapped in an
//! envelope carrying `seq`, `ts` and `request_id`. Decoders must skip tags
//! they do not know.

use crate::core::compiler::SqlParam;
use crate::core::types::Usage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Pipeline stage that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Router,
    Understander,
    Compiler,
    Executor,
    Narrator,
    Validator,
}

impl Agent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Understander => "understander",
            Self::Compiler => "compiler",
            Self::Executor => "executor",
            Self::Narrator => "narrator",
            Self::Validator => "validator",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one pipeline step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Rewrite,
    Failed,
}

/// How a request ended when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Answered,
    Clarification,
    Conversation,
}

/// Stream event. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StepStart {
        agent: Agent,
        message: String,
    },
    ToolStart {
        agent: Agent,
        name: String,
        input: Value,
    },
    ToolEnd {
        agent: Agent,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration: f64,
    },
    SqlExecuted {
        query: String,
        #[serde(default)]
        params: Vec<SqlParam>,
        rows_found: usize,
        #[serde(default)]
        error: Option<String>,
        duration: f64,
    },
    TextDelta {
        agent: Agent,
        content: String,
    },
    Validation {
        status: ValidationStatus,
        #[serde(default)]
        issues: Vec<String>,
        #[serde(default)]
        feedback: Option<String>,
    },
    StepEnd {
        agent: Agent,
        state: StepState,
        result: Value,
        duration: f64,
    },
    Usage(Usage),
    Done {
        request_id: String,
        status: DoneStatus,
        total_duration: f64,
        uncertain: bool,
        usage: Usage,
    },
    Error {
        message: String,
    },
}

/// Tags this decoder understands.
pub const KNOWN_EVENTS: [&str; 10] = [
    "step_start",
    "tool_start",
    "tool_end",
    "sql_executed",
    "text_delta",
    "validation",
    "step_end",
    "usage",
    "done",
    "error",
];

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StepStart { .. } => "step_start",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::SqlExecuted { .. } => "sql_executed",
            Self::TextDelta { .. } => "text_delta",
            Self::Validation { .. } => "validation",
            Self::StepEnd { .. } => "step_end",
            Self::Usage(_) => "usage",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// `done` and `error` end a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// One line of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub ts: String,
    pub request_id: String,
    #[serde(flatten)]
    pub event: Event,
}

/// Result of decoding one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(Envelope),
    /// A well-formed record with a tag this decoder does not know.
    Unknown { event: String, raw: Value },
}

pub fn encode_line(envelope: &Envelope) -> Result<String, String> {
    serde_json::to_string(envelope).map_err(|e| format!("JSON serialize error: {}", e))
}

/// Decode one JSONL line. Unknown tags are not errors.
pub fn decode_line(line: &str) -> Result<Decoded, String> {
    let raw: Value =
        serde_json::from_str(line).map_err(|e| format!("JSON parse error: {}", e))?;
    let tag = raw
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| "record has no event tag".to_string())?
        .to_string();
    if !KNOWN_EVENTS.contains(&tag.as_str()) {
        return Ok(Decoded::Unknown { event: tag, raw });
    }
    serde_json::from_value(raw)
        .map(Decoded::Known)
        .map_err(|e| format!("invalid {} record: {}", tag, e))
}

/// Full narration from the last narrator attempt.
///
/// Each narrator `step_start` opens a new attempt. Streams without a
/// narrator step (clarifications) concatenate every fragment.
pub fn reconstruct_narration(events: &[Envelope]) -> String {
    let mut text = String::new();
    for envelope in events {
        match &envelope.event {
            Event::StepStart {
                agent: Agent::Narrator,
                ..
            } => text.clear(),
            Event::TextDelta { content, .. } => text.push_str(content),
            _ => {}
        }
    }
    text
}

/// A tool call recorded within a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Option<f64>,
}

/// Ordered record of one stage's execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStep {
    pub agent: Agent,
    pub message: String,
    pub state: StepState,
    pub tools: Vec<ToolCall>,
    pub result: Option<Value>,
    pub duration: Option<f64>,
}

/// Rebuild the step records of one request from its events.
pub fn fold_steps(events: &[Envelope]) -> Vec<PipelineStep> {
    let mut steps: Vec<PipelineStep> = Vec::new();
    for envelope in events {
        match &envelope.event {
            Event::StepStart { agent, message } => steps.push(PipelineStep {
                agent: *agent,
                message: message.clone(),
                state: StepState::Running,
                tools: Vec::new(),
                result: None,
                duration: None,
            }),
            Event::ToolStart { name, input, .. } => {
                if let Some(step) = steps.last_mut() {
                    step.tools.push(ToolCall {
                        name: name.clone(),
                        input: input.clone(),
                        result: None,
                        error: None,
                        duration: None,
                    });
                }
            }
            Event::ToolEnd {
                name,
                result,
                error,
                duration,
                ..
            } => {
                let open = steps
                    .last_mut()
                    .and_then(|s| s.tools.iter_mut().rev().find(|t| &t.name == name));
                if let Some(tool) = open {
                    tool.result = result.clone();
                    tool.error = error.clone();
                    tool.duration = Some(*duration);
                }
            }
            Event::StepEnd {
                state,
                result,
                duration,
                ..
            } => {
                if let Some(step) = steps.last_mut() {
                    step.state = *state;
                    step.result = Some(result.clone());
                    step.duration = Some(*duration);
                }
            }
            Event::Error { .. } => {
                if let Some(step) = steps.last_mut() {
                    if step.state == StepState::Running {
                        step.state = StepState::Failed;
                    }
                }
            }
            _ => {}
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(seq: u64, event: Event) -> Envelope {
        Envelope {
            seq,
            ts: "2024-01-01T00:00:00Z".into(),
            request_id: "q-1".into(),
            event,
        }
    }

    fn delta(agent: Agent, content: &str) -> Event {
        Event::TextDelta {
            agent,
            content: content.into(),
        }
    }

    fn start(agent: Agent) -> Event {
        Event::StepStart {
            agent,
            message: String::new(),
        }
    }

    #[test]
    fn test_mq030_envelope_is_flat() {
        let line = encode_line(&env(3, delta(Agent::Narrator, "hi"))).unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"], "text_delta");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["content"], "hi");
        assert_eq!(v["agent"], "narrator");
    }

    #[test]
    fn test_mq030_decode_known() {
        let e = env(
            0,
            Event::Done {
                request_id: "q-1".into(),
                status: DoneStatus::Answered,
                total_duration: 0.25,
                uncertain: false,
                usage: Usage::default(),
            },
        );
        let line = encode_line(&e).unwrap();
        assert_eq!(decode_line(&line).unwrap(), Decoded::Known(e));
    }

    #[test]
    fn test_mq030_decode_usage_inline() {
        let e = env(
            7,
            Event::Usage(Usage {
                input_tokens: 12,
                output_tokens: 3,
                thinking_tokens: 0,
                cost: 0.5,
            }),
        );
        let line = encode_line(&e).unwrap();
        assert!(line.contains("\"input_tokens\":12"));
        assert_eq!(decode_line(&line).unwrap(), Decoded::Known(e));
    }

    #[test]
    fn test_mq030_unknown_tag_is_not_an_error() {
        let line = r#"{"seq":1,"ts":"x","request_id":"q","event":"heartbeat","n":1}"#;
        match decode_line(line).unwrap() {
            Decoded::Unknown { event, raw } => {
                assert_eq!(event, "heartbeat");
                assert_eq!(raw["n"], 1);
            }
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_mq030_malformed_lines() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"seq":1}"#).is_err());
        assert!(decode_line(r#"{"event":"text_delta","seq":1}"#).is_err());
    }

    #[test]
    fn test_mq030_sql_executed_keeps_params() {
        let e = env(
            2,
            Event::SqlExecuted {
                query: "SELECT ?".into(),
                params: vec![SqlParam::Text("NQ".into()), SqlParam::Integer(4)],
                rows_found: 1,
                error: None,
                duration: 0.001,
            },
        );
        let line = encode_line(&e).unwrap();
        assert_eq!(decode_line(&line).unwrap(), Decoded::Known(e));
    }

    #[test]
    fn test_mq030_narration_uses_last_attempt() {
        let events = vec![
            env(0, start(Agent::Narrator)),
            env(1, delta(Agent::Narrator, "first ")),
            env(2, delta(Agent::Narrator, "draft")),
            env(3, start(Agent::Validator)),
            env(4, start(Agent::Narrator)),
            env(5, delta(Agent::Narrator, "second ")),
            env(6, delta(Agent::Narrator, "draft")),
        ];
        assert_eq!(reconstruct_narration(&events), "second draft");
    }

    #[test]
    fn test_mq030_narration_without_narrator() {
        let events = vec![
            env(0, start(Agent::Understander)),
            env(1, delta(Agent::Understander, "Which year?")),
        ];
        assert_eq!(reconstruct_narration(&events), "Which year?");
    }

    #[test]
    fn test_mq030_fold_steps() {
        let events = vec![
            env(0, start(Agent::Understander)),
            env(
                1,
                Event::ToolStart {
                    agent: Agent::Understander,
                    name: "extract".into(),
                    input: json!({"q": 1}),
                },
            ),
            env(
                2,
                Event::ToolEnd {
                    agent: Agent::Understander,
                    name: "extract".into(),
                    result: None,
                    error: Some("rejected".into()),
                    duration: 0.5,
                },
            ),
            env(
                3,
                Event::StepEnd {
                    agent: Agent::Understander,
                    state: StepState::Completed,
                    result: json!({}),
                    duration: 0.6,
                },
            ),
            env(4, start(Agent::Executor)),
            env(
                5,
                Event::Error {
                    message: "boom".into(),
                },
            ),
        ];
        let steps = fold_steps(&events);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].state, StepState::Completed);
        assert_eq!(steps[0].tools[0].error.as_deref(), Some("rejected"));
        assert_eq!(steps[1].state, StepState::Failed);
    }

    #[test]
    fn test_mq030_terminal_events() {
        assert!(Event::Error { message: "x".into() }.is_terminal());
        assert!(!delta(Agent::Narrator, "x").is_terminal());
        assert_eq!(delta(Agent::Narrator, "x").name(), "text_delta");
    }
}
