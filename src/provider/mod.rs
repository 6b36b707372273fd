//! MQ-040: External collaborators. Completion provider and narrator.
//!
//! Both are stochastic in production, so the pipeline only sees them
//! through these traits and treats their output as untrusted.

pub mod scripted;
pub mod template;

use crate::core::compiler::CompiledQuery;
use crate::core::error::ProviderError;
use crate::core::types::{Ambiguity, QuerySpecification, Usage};
use crate::engine::RowSet;
use async_trait::async_trait;
use serde_json::Value;

/// What the understanding fallback asks the provider for.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub question: &'a str,
    /// Derived tool schema from the schema registry.
    pub tool: &'a Value,
    /// Facets the rule chunks left unresolved.
    pub unresolved: &'a [Ambiguity],
}

/// A structured proposal plus what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub proposal: Value,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest<'_>) -> Result<Completion, ProviderError>;
}

/// Receives narration fragments as they are produced.
#[async_trait]
pub trait FragmentSink: Send {
    async fn fragment(&mut self, text: &str) -> Result<(), ProviderError>;
}

/// What the narrator is asked to describe.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    /// Result rows of a compiled query.
    Data {
        spec: &'a QuerySpecification,
        query: &'a CompiledQuery,
        rows: &'a RowSet,
    },
    /// A conversational turn with no data behind it.
    Conversation,
}

#[derive(Debug, Clone, Copy)]
pub struct NarrationRequest<'a> {
    pub question: &'a str,
    pub subject: Subject<'a>,
    /// Validator feedback from earlier attempts, oldest first.
    pub feedback: &'a [String],
    /// Zero for the first attempt.
    pub attempt: u32,
}

#[async_trait]
pub trait Narrator: Send + Sync {
    /// Stream fragments into `sink`; concatenated they are the narration.
    async fn narrate(
        &self,
        request: &NarrationRequest<'_>,
        sink: &mut dyn FragmentSink,
    ) -> Result<Usage, ProviderError>;
}

/// Split text into word-sized fragments, keeping whitespace attached.
pub fn fragments(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else if in_space {
            out.push(&text[start..i]);
            start = i;
            in_space = false;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}
