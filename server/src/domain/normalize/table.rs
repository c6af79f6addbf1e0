//! Attribute driver table
//!
//! One descriptor per canonical field. Built once and shared read-only by
//! every normalization.

use std::sync::LazyLock;

use crate::data::types::{
    COL_CALL_TYPE, COL_INPUT, COL_OUTPUT, COL_SPAN_TYPE, COL_WORKSPACE_ID, TAG_ERROR,
    TAG_INPUT_TOKENS, TAG_MODEL_NAME, TAG_MODEL_PROVIDER, TAG_OUTPUT_TOKENS,
    TAG_START_TIME_FIRST_RESP,
};

pub const FIELD_TEMPERATURE: &str = "temperature";
pub const FIELD_TOP_P: &str = "top_p";
pub const FIELD_TOP_K: &str = "top_k";
pub const FIELD_MAX_TOKENS: &str = "max_tokens";
pub const FIELD_FREQUENCY_PENALTY: &str = "frequency_penalty";
pub const FIELD_PRESENCE_PENALTY: &str = "presence_penalty";
pub const FIELD_STOP_SEQUENCES: &str = "stop_sequences";

/// Tool description prefixes; consumed by the input assembly, never tags
pub const GEN_AI_FUNCTIONS_PREFIX: &str = "gen_ai.request.functions";
pub const OPENINFERENCE_TOOLS_PREFIX: &str = "llm.tools";

pub const GEN_AI_PROMPT_PREFIX: &str = "gen_ai.prompt";
pub const GEN_AI_COMPLETION_PREFIX: &str = "gen_ai.completion";
pub const OPENINFERENCE_INPUT_PREFIX: &str = "llm.input_messages";
pub const OPENINFERENCE_OUTPUT_PREFIX: &str = "llm.output_messages";

/// Resource attributes feeding the runtime system tag
pub const RESOURCE_SDK_LANGUAGE: &str = "telemetry.sdk.language";
pub const RESOURCE_SDK_VERSION: &str = "telemetry.sdk.version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Long,
    Double,
    ArrayString,
}

/// Post-aggregation wrap step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    /// `v` becomes `{key: v}`
    Under(&'static str),
    /// each list item `x` becomes `{key: x}`
    EachUnder(&'static str),
}

/// How an aggregated subtree is turned into the field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    /// Apply wrap steps in order
    Wrap(&'static [Wrap]),
    /// Delegate to the OpenInference message converter
    OpenInferenceInput,
    OpenInferenceOutput,
}

#[derive(Debug, Clone)]
pub struct PrefixRule {
    pub prefix: &'static str,
    pub convert: Convert,
}

#[derive(Debug, Clone)]
pub struct EventRule {
    pub names: &'static [&'static str],
    /// Take one attribute of the last matching event instead of aggregating
    pub attr: Option<&'static str>,
    pub wrap: &'static [Wrap],
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: &'static str,
    /// First key present wins
    pub exact_keys: &'static [&'static str],
    pub prefixes: Vec<PrefixRule>,
    pub events: Option<EventRule>,
    pub data_type: DataType,
    /// Lands in a tag bag rather than a top-level column
    pub is_tag: bool,
}

impl FieldDescriptor {
    fn column(name: &'static str, exact_keys: &'static [&'static str]) -> Self {
        Self {
            name,
            exact_keys,
            prefixes: Vec::new(),
            events: None,
            data_type: DataType::String,
            is_tag: false,
        }
    }

    fn tag(name: &'static str, data_type: DataType, exact_keys: &'static [&'static str]) -> Self {
        Self {
            name,
            exact_keys,
            prefixes: Vec::new(),
            events: None,
            data_type,
            is_tag: true,
        }
    }
}

pub struct DriverTable {
    pub fields: Vec<FieldDescriptor>,
    /// Prefixes claimed without producing a field of their own
    pub side_prefixes: &'static [&'static str],
}

impl DriverTable {
    /// Whether an attribute key is consumed by some descriptor
    pub fn is_registered(&self, key: &str) -> bool {
        self.fields.iter().any(|f| {
            f.exact_keys.contains(&key)
                || f.prefixes.iter().any(|p| has_prefix(key, p.prefix))
        }) || self.side_prefixes.iter().any(|p| has_prefix(key, p))
    }

    #[cfg(test)]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// `key` is `prefix` followed by a dotted path
pub fn has_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1)
}

pub static DRIVER_TABLE: LazyLock<DriverTable> = LazyLock::new(build_table);

fn build_table() -> DriverTable {
    use DataType::*;

    let input = FieldDescriptor {
        name: COL_INPUT,
        exact_keys: &["cozeloop.input", "input.value"],
        prefixes: vec![
            PrefixRule {
                prefix: GEN_AI_PROMPT_PREFIX,
                convert: Convert::Wrap(&[Wrap::Under("messages")]),
            },
            PrefixRule {
                prefix: OPENINFERENCE_INPUT_PREFIX,
                convert: Convert::OpenInferenceInput,
            },
        ],
        events: Some(EventRule {
            names: &[
                "gen_ai.system.message",
                "gen_ai.user.message",
                "gen_ai.assistant.message",
                "gen_ai.tool.message",
            ],
            attr: None,
            wrap: &[Wrap::Under("messages")],
        }),
        data_type: String,
        is_tag: false,
    };

    let output = FieldDescriptor {
        name: COL_OUTPUT,
        exact_keys: &["cozeloop.output", "output.value"],
        prefixes: vec![
            PrefixRule {
                prefix: GEN_AI_COMPLETION_PREFIX,
                convert: Convert::Wrap(&[Wrap::EachUnder("message"), Wrap::Under("choices")]),
            },
            PrefixRule {
                prefix: OPENINFERENCE_OUTPUT_PREFIX,
                convert: Convert::OpenInferenceOutput,
            },
        ],
        events: Some(EventRule {
            names: &["gen_ai.choice"],
            attr: None,
            wrap: &[Wrap::Under("choices")],
        }),
        data_type: String,
        is_tag: false,
    };

    let error = FieldDescriptor {
        events: Some(EventRule {
            names: &["exception"],
            attr: Some("exception.message"),
            wrap: &[],
        }),
        ..FieldDescriptor::tag(TAG_ERROR, String, &["cozeloop.error", "exception.message"])
    };

    DriverTable {
        fields: vec![
            FieldDescriptor::column(COL_WORKSPACE_ID, &["cozeloop.workspace_id"]),
            FieldDescriptor::column(
                COL_SPAN_TYPE,
                &[
                    "cozeloop.span_type",
                    "gen_ai.operation.name",
                    "openinference.span.kind",
                ],
            ),
            FieldDescriptor::column(COL_CALL_TYPE, &["cozeloop.call_type"]),
            input,
            output,
            error,
            FieldDescriptor::tag(
                TAG_MODEL_PROVIDER,
                String,
                &[
                    "cozeloop.model_provider",
                    "gen_ai.system",
                    "gen_ai.provider.name",
                    "llm.provider",
                    "llm.system",
                ],
            ),
            FieldDescriptor::tag(
                TAG_MODEL_NAME,
                String,
                &[
                    "cozeloop.model_name",
                    "gen_ai.request.model",
                    "gen_ai.response.model",
                    "llm.model_name",
                ],
            ),
            FieldDescriptor::tag(
                TAG_INPUT_TOKENS,
                Long,
                &[
                    "cozeloop.input_tokens",
                    "gen_ai.usage.input_tokens",
                    "gen_ai.usage.prompt_tokens",
                    "llm.token_count.prompt",
                ],
            ),
            FieldDescriptor::tag(
                TAG_OUTPUT_TOKENS,
                Long,
                &[
                    "cozeloop.output_tokens",
                    "gen_ai.usage.output_tokens",
                    "gen_ai.usage.completion_tokens",
                    "llm.token_count.completion",
                ],
            ),
            FieldDescriptor::tag(
                TAG_START_TIME_FIRST_RESP,
                Long,
                &["cozeloop.start_time_first_resp"],
            ),
            FieldDescriptor::tag(
                FIELD_TEMPERATURE,
                Double,
                &["cozeloop.temperature", "gen_ai.request.temperature"],
            ),
            FieldDescriptor::tag(FIELD_TOP_P, Double, &["cozeloop.top_p", "gen_ai.request.top_p"]),
            FieldDescriptor::tag(FIELD_TOP_K, Long, &["cozeloop.top_k", "gen_ai.request.top_k"]),
            FieldDescriptor::tag(
                FIELD_MAX_TOKENS,
                Long,
                &["cozeloop.max_tokens", "gen_ai.request.max_tokens"],
            ),
            FieldDescriptor::tag(
                FIELD_FREQUENCY_PENALTY,
                Double,
                &[
                    "cozeloop.frequency_penalty",
                    "gen_ai.request.frequency_penalty",
                ],
            ),
            FieldDescriptor::tag(
                FIELD_PRESENCE_PENALTY,
                Double,
                &[
                    "cozeloop.presence_penalty",
                    "gen_ai.request.presence_penalty",
                ],
            ),
            FieldDescriptor::tag(
                FIELD_STOP_SEQUENCES,
                ArrayString,
                &["cozeloop.stop_sequences", "gen_ai.request.stop_sequences"],
            ),
            FieldDescriptor::tag("user_id", String, &["cozeloop.user_id", "user.id"]),
            FieldDescriptor::tag("thread_id", String, &["cozeloop.thread_id", "session.id"]),
            FieldDescriptor::tag(
                "message_id",
                String,
                &["cozeloop.message_id", "messaging.message.id"],
            ),
            FieldDescriptor::tag("prompt_key", String, &["cozeloop.prompt_key"]),
            FieldDescriptor::tag("prompt_version", String, &["cozeloop.prompt_version"]),
        ],
        side_prefixes: &[GEN_AI_FUNCTIONS_PREFIX, OPENINFERENCE_TOOLS_PREFIX],
    }
}
