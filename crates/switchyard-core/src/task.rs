//! Task types and the keyword classifier used for task-aware routing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse category of work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Writing, reviewing or debugging code.
    Code,
    /// Multi-step reasoning, math, planning.
    Reasoning,
    /// Fiction, poetry, marketing copy.
    Creative,
    /// Condensing a longer text.
    Summarization,
    /// Pulling structured data out of text.
    Extraction,
    /// General chat; the fallback category.
    Conversation,
}

/// Keyword table consulted in order; the first category with a hit wins.
const KEYWORDS: &[(TaskType, &[&str])] = &[
    (
        TaskType::Code,
        &[
            "```", "code", "function", "compile", "bug", "debug", "refactor", "stack trace",
            "python", "rust", "javascript", "typescript", "sql", "regex", "unit test",
        ],
    ),
    (
        TaskType::Summarization,
        &["summarize", "summarise", "summary", "tl;dr", "tldr", "condense", "key points"],
    ),
    (
        TaskType::Extraction,
        &["extract", "parse", "json schema", "fields from", "list all", "pull out"],
    ),
    (
        TaskType::Reasoning,
        &[
            "prove", "reason", "step by step", "calculate", "solve", "math", "logic",
            "analyze", "analyse", "why does", "plan",
        ],
    ),
    (
        TaskType::Creative,
        &["story", "poem", "creative", "imagine", "lyrics", "slogan", "fiction", "write a"],
    ),
];

impl TaskType {
    /// All task types, in classification order.
    pub const ALL: [TaskType; 6] = [
        TaskType::Code,
        TaskType::Reasoning,
        TaskType::Creative,
        TaskType::Summarization,
        TaskType::Extraction,
        TaskType::Conversation,
    ];

    /// Stable tag string, also used as a capability tag.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Reasoning => "reasoning",
            TaskType::Creative => "creative",
            TaskType::Summarization => "summarization",
            TaskType::Extraction => "extraction",
            TaskType::Conversation => "conversation",
        }
    }

    /// Classify free text by keyword. Falls back to [`TaskType::Conversation`].
    pub fn classify_text(text: &str) -> TaskType {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(task, _)| *task)
            .unwrap_or(TaskType::Conversation)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "code" | "coding" => Ok(TaskType::Code),
            "reasoning" | "analysis" => Ok(TaskType::Reasoning),
            "creative" | "writing" => Ok(TaskType::Creative),
            "summarization" | "summary" => Ok(TaskType::Summarization),
            "extraction" => Ok(TaskType::Extraction),
            "conversation" | "chat" | "general" => Ok(TaskType::Conversation),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_keyword() {
        assert_eq!(
            TaskType::classify_text("Fix this Rust function please"),
            TaskType::Code
        );
        assert_eq!(
            TaskType::classify_text("Summarize the following article"),
            TaskType::Summarization
        );
        assert_eq!(
            TaskType::classify_text("Write a poem about autumn"),
            TaskType::Creative
        );
        assert_eq!(
            TaskType::classify_text("Solve for x step by step"),
            TaskType::Reasoning
        );
        assert_eq!(TaskType::classify_text("hello there"), TaskType::Conversation);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("coding".parse::<TaskType>().unwrap(), TaskType::Code);
        assert_eq!("Chat".parse::<TaskType>().unwrap(), TaskType::Conversation);
        assert!("astrology".parse::<TaskType>().is_err());
    }
}
