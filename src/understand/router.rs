//! MQ-052: Router. Data question or conversational turn.

use super::chunks::{words, ChunkInput, RuleChunk};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Data,
    Conversation,
}

fn small_talk() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:hi|hello|hey|thanks|thank you|cheers|bye|goodbye|good (?:morning|afternoon|evening)|who are you|what can you do|help)\b",
        )
        .expect("static regex")
    })
}

/// Routes a turn by whether any rule chunk recognises data facets in it.
///
/// Greetings and meta questions go to conversation even when they happen
/// to contain a data word, unless they also name a symbol.
pub struct Router {
    chunks: Vec<Box<dyn RuleChunk>>,
    symbols: Vec<String>,
}

impl Router {
    pub fn new(chunks: Vec<Box<dyn RuleChunk>>, symbols: &[String]) -> Self {
        Self {
            chunks,
            symbols: symbols.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn route(&self, question: &str, today: NaiveDate) -> Route {
        let lower = question.to_lowercase();
        let names_symbol = words(&lower).any(|w| self.symbols.iter().any(|s| s == w));
        if small_talk().is_match(&lower) && !names_symbol {
            return Route::Conversation;
        }
        if names_symbol {
            return Route::Data;
        }
        let input = ChunkInput {
            text: &lower,
            today,
        };
        if self.chunks.iter().any(|c| !c.apply(&input).is_empty()) {
            Route::Data
        } else {
            Route::Conversation
        }
    }
}
