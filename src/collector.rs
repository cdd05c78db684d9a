use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context as AnyhowContext, Result};

use crate::record::ResponseRecord;

/// Append-only sink for completed response records.
///
/// The collector owns the output file handle for the duration of a run, so a
/// record can only be saved while the collector is in scope; dropping it
/// closes the file on every exit path. Each record is flushed as soon as it is
/// written, leaving a valid readable prefix if the run is interrupted.
pub struct ResponseCollector {
    file: File,
    path: PathBuf,
}

impl ResponseCollector {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one pretty-printed record followed by a blank-line separator
    /// and flushes immediately.
    pub fn save(&mut self, record: &ResponseRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)
            .with_context(|| format!("Failed to serialize record '{}'", record.prompt_id))?;
        self.file
            .write_all(json.as_bytes())
            .and_then(|_| self.file.write_all(b"\n\n"))
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to append record to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        LogProbContent, LogProbs, ResponseOutput, TokenLogProb, Usage, read_records,
    };
    use serde_json::Map;
    use tempfile::tempdir;

    fn record(prompt_id: &str, output: ResponseOutput) -> ResponseRecord {
        ResponseRecord {
            run_id: "run-7".into(),
            model: "model-a".into(),
            prompt_id: prompt_id.into(),
            variables: Map::new(),
            prompt_text: "user text".into(),
            system_text: "system text".into(),
            output,
            finish_reason: Some("stop".into()),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 5,
                total_tokens: 8,
            },
            timestamp: "2026-01-02T03:04:05Z".parse().unwrap(),
        }
    }

    #[test]
    fn saved_records_round_trip_through_the_reader() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("responses.jsonl");

        let text = record("first", ResponseOutput::Text("answer".into()));
        let logprobs = record(
            "second",
            ResponseOutput::LogProbs(LogProbs {
                content: vec![LogProbContent {
                    token: "a".into(),
                    logprob: -0.5,
                    top_logprobs: vec![TokenLogProb {
                        token: "a".into(),
                        logprob: -0.5,
                    }],
                }],
            }),
        );

        {
            let mut collector = ResponseCollector::create(&path).unwrap();
            collector.save(&text).unwrap();
            collector.save(&logprobs).unwrap();
        }

        let loaded = read_records(&path).expect("file parses back");
        assert_eq!(loaded, vec![text, logprobs]);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("dir").join("out.jsonl");
        let collector = ResponseCollector::create(&path).unwrap();
        assert_eq!(collector.path(), path);
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn reopening_appends_after_existing_records() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("responses.jsonl");

        {
            let mut collector = ResponseCollector::create(&path).unwrap();
            collector
                .save(&record("first", ResponseOutput::Text("one".into())))
                .unwrap();
        }
        {
            let mut collector = ResponseCollector::create(&path).unwrap();
            collector
                .save(&record("second", ResponseOutput::Text("two".into())))
                .unwrap();
        }

        let loaded = read_records(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].prompt_id, "second");
    }
}
