//! MQ-041: Scripted collaborators. Canned responses played back in order.
//!
//! Used by tests and by `marketql ask --script` to drive the pipeline
//! deterministically without a network provider.

use super::{
    fragments, Completion, CompletionProvider, ExtractionRequest, FragmentSink, NarrationRequest,
    Narrator,
};
use crate::core::error::ProviderError;
use crate::core::types::Usage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Usage charged per scripted call unless the script says otherwise.
pub const SCRIPTED_USAGE: Usage = Usage {
    input_tokens: 100,
    output_tokens: 20,
    thinking_tokens: 0,
    cost: 0.0,
};

/// One scripted provider reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScriptEntry {
    Reply {
        proposal: Value,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Fail {
        error: String,
    },
}

/// Plays back proposals in order; the last entry repeats once the script runs out.
pub struct ScriptedProvider {
    entries: Vec<ScriptEntry>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(entries: Vec<ScriptEntry>) -> Self {
        Self {
            entries,
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Every call returns `proposal`.
    pub fn always(proposal: Value) -> Self {
        Self::new(vec![ScriptEntry::Reply {
            proposal,
            usage: None,
        }])
    }

    /// Every call fails.
    pub fn failing(error: &str) -> Self {
        Self::new(vec![ScriptEntry::Fail {
            error: error.to_string(),
        }])
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Load a JSONL script: one `{"proposal": ...}` or `{"error": ...}` per line.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read script {}: {}", path.display(), e))?;
        let entries = content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| {
                serde_json::from_str(l).map_err(|e| format!("script line {}: {}", i + 1, e))
            })
            .collect::<Result<Vec<ScriptEntry>, String>>()?;
        if entries.is_empty() {
            return Err(format!("script {} is empty", path.display()));
        }
        Ok(Self::new(entries))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<Completion, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let entry = self
            .entries
            .get(call)
            .or_else(|| self.entries.last())
            .ok_or_else(|| ProviderError::Unavailable("empty script".to_string()))?;
        match entry {
            ScriptEntry::Reply { proposal, usage } => Ok(Completion {
                proposal: proposal.clone(),
                usage: usage.unwrap_or(SCRIPTED_USAGE),
            }),
            ScriptEntry::Fail { error } => Err(ProviderError::Unavailable(error.clone())),
        }
    }
}

/// Narrates canned texts by attempt; the last text repeats.
pub struct ScriptedNarrator {
    texts: Vec<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
}

impl ScriptedNarrator {
    pub fn new(texts: Vec<String>) -> Self {
        Self {
            texts,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeat(text: &str) -> Self {
        Self::new(vec![text.to_string()])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Feedback each invocation received, in call order.
    pub fn feedback_seen(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Narrator for ScriptedNarrator {
    async fn narrate(
        &self,
        request: &NarrationRequest<'_>,
        sink: &mut dyn FragmentSink,
    ) -> Result<Usage, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.feedback.to_vec());
        }
        let text = self
            .texts
            .get(call)
            .or_else(|| self.texts.last())
            .cloned()
            .unwrap_or_default();
        for part in fragments(&text) {
            sink.fragment(part).await?;
        }
        Ok(SCRIPTED_USAGE)
    }
}
