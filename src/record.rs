use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jsonl;

/// Token counts reported by the completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Per-token-position candidate data returned when a logprob depth was
/// requested: `content[pos]` holds the sampled token at that position plus the
/// top-ranked alternatives with their log-probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogProbs {
    pub content: Vec<LogProbContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogProbContent {
    pub token: String,
    pub logprob: f64,
    #[serde(default)]
    pub top_logprobs: Vec<TokenLogProb>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogProb {
    pub token: String,
    pub logprob: f64,
}

/// What a completed request produced: free text, or a logprob payload when the
/// template asked for per-token alternatives instead. Exactly one is present.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutput {
    Text(String),
    LogProbs(LogProbs),
}

impl ResponseOutput {
    pub fn text(&self) -> Option<&str> {
        match self {
            ResponseOutput::Text(text) => Some(text),
            ResponseOutput::LogProbs(_) => None,
        }
    }

    pub fn logprobs(&self) -> Option<&LogProbs> {
        match self {
            ResponseOutput::Text(_) => None,
            ResponseOutput::LogProbs(logprobs) => Some(logprobs),
        }
    }
}

/// One persisted unit of work: a completed (model, variant) request.
///
/// Records are appended to the output file in the order processed and never
/// mutated. On the wire the output enum becomes the two nullable fields
/// `response` / `logprobs`; re-reading rejects records populating both or
/// neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordWire", into = "RecordWire")]
pub struct ResponseRecord {
    pub run_id: String,
    pub model: String,
    pub prompt_id: String,
    pub variables: Map<String, Value>,
    pub prompt_text: String,
    pub system_text: String,
    pub output: ResponseOutput,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RecordWire {
    run_id: String,
    model: String,
    prompt_id: String,
    variables: Map<String, Value>,
    prompt_text: String,
    system_text: String,
    response: Option<String>,
    logprobs: Option<LogProbs>,
    finish_reason: Option<String>,
    usage: Usage,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RecordWire> for ResponseRecord {
    type Error = String;

    fn try_from(wire: RecordWire) -> Result<Self, Self::Error> {
        let output = match (wire.response, wire.logprobs) {
            (Some(text), None) => ResponseOutput::Text(text),
            (None, Some(logprobs)) => ResponseOutput::LogProbs(logprobs),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "record '{}' populates both response and logprobs",
                    wire.prompt_id
                ));
            }
            (None, None) => {
                return Err(format!(
                    "record '{}' populates neither response nor logprobs",
                    wire.prompt_id
                ));
            }
        };
        Ok(ResponseRecord {
            run_id: wire.run_id,
            model: wire.model,
            prompt_id: wire.prompt_id,
            variables: wire.variables,
            prompt_text: wire.prompt_text,
            system_text: wire.system_text,
            output,
            finish_reason: wire.finish_reason,
            usage: wire.usage,
            timestamp: wire.timestamp,
        })
    }
}

impl From<ResponseRecord> for RecordWire {
    fn from(record: ResponseRecord) -> Self {
        let (response, logprobs) = match record.output {
            ResponseOutput::Text(text) => (Some(text), None),
            ResponseOutput::LogProbs(payload) => (None, Some(payload)),
        };
        RecordWire {
            run_id: record.run_id,
            model: record.model,
            prompt_id: record.prompt_id,
            variables: record.variables,
            prompt_text: record.prompt_text,
            system_text: record.system_text,
            response,
            logprobs,
            finish_reason: record.finish_reason,
            usage: record.usage,
            timestamp: record.timestamp,
        }
    }
}

/// Reads every record from a previously collected response file, using the
/// same whitespace-tolerant multi-record reader the template loader uses.
pub fn read_records(path: &Path) -> Result<Vec<ResponseRecord>> {
    jsonl::read_seq(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text_record() -> ResponseRecord {
        let mut variables = Map::new();
        variables.insert("register".into(), Value::String("casual".into()));
        ResponseRecord {
            run_id: "run-1".into(),
            model: "meta-llama/Llama-3-8b-chat-hf".into(),
            prompt_id: "greeting".into(),
            variables,
            prompt_text: "Say hi in casual style.".into(),
            system_text: "You speak casual English.".into(),
            output: ResponseOutput::Text("hey there!".into()),
            finish_reason: Some("stop".into()),
            usage: Usage {
                prompt_tokens: 12,
                completion_tokens: 4,
                total_tokens: 16,
            },
            timestamp: "2026-01-02T03:04:05Z".parse().unwrap(),
        }
    }

    fn sample_logprob_record() -> ResponseRecord {
        let content = vec![LogProbContent {
            token: "hey".into(),
            logprob: -0.1,
            top_logprobs: vec![
                TokenLogProb {
                    token: "hey".into(),
                    logprob: -0.1,
                },
                TokenLogProb {
                    token: "hi".into(),
                    logprob: -2.3,
                },
            ],
        }];
        ResponseRecord {
            output: ResponseOutput::LogProbs(LogProbs { content }),
            ..sample_text_record()
        }
    }

    #[test]
    fn text_record_serializes_with_null_logprobs() {
        let json = serde_json::to_value(sample_text_record()).unwrap();
        assert_eq!(json["response"], "hey there!");
        assert!(json["logprobs"].is_null());
        assert_eq!(json["usage"]["total_tokens"], 16);
        assert_eq!(json["timestamp"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn logprob_record_serializes_with_null_response() {
        let json = serde_json::to_value(sample_logprob_record()).unwrap();
        assert!(json["response"].is_null());
        assert_eq!(json["logprobs"]["content"][0]["token"], "hey");
    }

    #[test]
    fn round_trips_both_output_kinds() {
        for record in [sample_text_record(), sample_logprob_record()] {
            let json = serde_json::to_string_pretty(&record).unwrap();
            let back: ResponseRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn rejects_record_with_both_outputs() {
        let mut json = serde_json::to_value(sample_text_record()).unwrap();
        json["logprobs"] = serde_json::json!({ "content": [] });
        let err = serde_json::from_value::<ResponseRecord>(json).unwrap_err();
        assert!(err.to_string().contains("both response and logprobs"));
    }

    #[test]
    fn rejects_record_with_neither_output() {
        let mut json = serde_json::to_value(sample_text_record()).unwrap();
        json["response"] = Value::Null;
        let err = serde_json::from_value::<ResponseRecord>(json).unwrap_err();
        assert!(err.to_string().contains("neither response nor logprobs"));
    }
}
