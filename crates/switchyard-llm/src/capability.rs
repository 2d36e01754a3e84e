//! Capability tags: the model each provider serves for a tag, and how
//! strong each model family is at each tag.
//!
//! Tags are the three tiers (`premium`, `balanced`, `efficient`) plus the
//! task-type tags from [`switchyard_core::TaskType::as_str`].

/// Every tag the tables know, in column order of [`STRENGTHS`].
pub const CAPABILITY_TAGS: [&str; 9] = [
    "code",
    "reasoning",
    "creative",
    "summarization",
    "extraction",
    "conversation",
    "premium",
    "balanced",
    "efficient",
];

const ANTHROPIC_OPUS: &str = "claude-opus-4-20250514";
const ANTHROPIC_SONNET: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_HAIKU: &str = "claude-3-5-haiku-20241022";

const OPENAI_4O: &str = "gpt-4o";
const OPENAI_4O_MINI: &str = "gpt-4o-mini";

const OLLAMA_LARGE: &str = "llama3.1:70b";
const OLLAMA_MEDIUM: &str = "llama3.1";
const OLLAMA_SMALL: &str = "llama3.2";
const OLLAMA_CODER: &str = "qwen2.5-coder";

/// Model used by the mock adapter when none is named.
pub const MOCK_MODEL: &str = "mock-model";

/// Capability → model, per provider. Columns follow [`CAPABILITY_TAGS`].
const MODEL_TABLE: &[(&str, [&str; 9])] = &[
    (
        "anthropic",
        [
            ANTHROPIC_SONNET,
            ANTHROPIC_OPUS,
            ANTHROPIC_SONNET,
            ANTHROPIC_HAIKU,
            ANTHROPIC_HAIKU,
            ANTHROPIC_SONNET,
            ANTHROPIC_OPUS,
            ANTHROPIC_SONNET,
            ANTHROPIC_HAIKU,
        ],
    ),
    (
        "openai",
        [
            OPENAI_4O,
            OPENAI_4O,
            OPENAI_4O,
            OPENAI_4O_MINI,
            OPENAI_4O_MINI,
            OPENAI_4O_MINI,
            OPENAI_4O,
            OPENAI_4O,
            OPENAI_4O_MINI,
        ],
    ),
    (
        "ollama",
        [
            OLLAMA_CODER,
            OLLAMA_LARGE,
            OLLAMA_MEDIUM,
            OLLAMA_SMALL,
            OLLAMA_SMALL,
            OLLAMA_MEDIUM,
            OLLAMA_LARGE,
            OLLAMA_MEDIUM,
            OLLAMA_SMALL,
        ],
    ),
    ("mock", [MOCK_MODEL; 9]),
];

/// Strength 0..=4 of a model family per tag, matched by longest prefix.
/// Columns follow [`CAPABILITY_TAGS`].
const STRENGTHS: &[(&str, [u8; 9])] = &[
    ("claude-opus-4", [4, 4, 4, 4, 3, 4, 4, 2, 0]),
    ("claude-3-opus", [3, 4, 4, 3, 3, 3, 4, 2, 0]),
    ("claude-sonnet-4", [4, 3, 3, 3, 3, 3, 2, 4, 1]),
    ("claude-3-7-sonnet", [4, 3, 3, 3, 3, 3, 2, 4, 1]),
    ("claude-3-5-sonnet", [4, 3, 3, 3, 3, 3, 2, 4, 1]),
    ("claude-3-5-haiku", [2, 2, 2, 3, 3, 3, 0, 2, 4]),
    ("claude-3-haiku", [1, 1, 2, 3, 3, 3, 0, 1, 4]),
    ("gpt-4o-mini", [2, 2, 2, 3, 3, 3, 0, 2, 4]),
    ("gpt-4o", [3, 3, 3, 3, 3, 3, 3, 4, 1]),
    ("gpt-4.1-mini", [3, 2, 2, 3, 3, 3, 0, 3, 4]),
    ("gpt-4.1", [4, 3, 3, 3, 3, 3, 3, 4, 1]),
    ("gpt-4-turbo", [3, 3, 3, 3, 3, 3, 3, 3, 0]),
    ("gpt-3.5-turbo", [1, 1, 2, 2, 2, 2, 0, 1, 3]),
    ("o1", [3, 4, 2, 2, 2, 1, 4, 1, 0]),
    ("o3", [4, 4, 2, 2, 2, 1, 4, 1, 0]),
    ("llama3.1:70b", [2, 3, 3, 3, 2, 3, 3, 2, 1]),
    ("llama3", [1, 2, 2, 2, 2, 2, 1, 2, 3]),
    ("qwen2.5-coder", [4, 2, 1, 1, 2, 1, 1, 2, 2]),
    ("codellama", [3, 1, 1, 1, 1, 1, 0, 2, 2]),
    ("deepseek-coder", [4, 2, 1, 1, 2, 1, 1, 2, 2]),
    ("mistral", [1, 2, 2, 2, 2, 2, 1, 2, 3]),
    ("mock", [1; 9]),
];

fn tag_index(capability: &str) -> Option<usize> {
    let tag = capability.trim().to_ascii_lowercase();
    CAPABILITY_TAGS.iter().position(|t| *t == tag)
}

/// Whether `capability` is a tag the tables know.
pub fn is_known_tag(capability: &str) -> bool {
    tag_index(capability).is_some()
}

/// The model `provider` serves for `capability`, if both are known.
pub fn model_for(provider: &str, capability: &str) -> Option<&'static str> {
    let idx = tag_index(capability)?;
    MODEL_TABLE
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, models)| models[idx])
}

/// The model a provider uses when nothing narrows the choice.
pub fn default_model(provider: &str) -> Option<&'static str> {
    model_for(provider, "balanced")
}

/// Every model named in `provider`'s capability table, deduplicated.
pub fn table_models(provider: &str) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    if let Some((_, models)) = MODEL_TABLE.iter().find(|(name, _)| *name == provider) {
        for model in models {
            if !out.contains(model) {
                out.push(*model);
            }
        }
    }
    out
}

/// Strength of `model` at `capability`, 0 when either is unknown.
pub fn strength(model: &str, capability: &str) -> u8 {
    let Some(idx) = tag_index(capability) else {
        return 0;
    };
    STRENGTHS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map_or(0, |(_, scores)| scores[idx])
}
