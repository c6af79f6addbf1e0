//! Source platforms and span list views

use std::fmt;

use serde::{Deserialize, Serialize};

/// Product surface a query originates from; selects tenants and builtin filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    #[default]
    Cozeloop,
    Prompt,
    Evaluator,
    EvaluationTarget,
}

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cozeloop => "cozeloop",
            Self::Prompt => "prompt",
            Self::Evaluator => "evaluator",
            Self::EvaluationTarget => "evaluation_target",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse view selector for ListSpans
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanListType {
    #[default]
    RootSpan,
    LlmSpan,
    AllSpan,
}

impl SpanListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootSpan => "root_span",
            Self::LlmSpan => "llm_span",
            Self::AllSpan => "all_span",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root_span" => Some(Self::RootSpan),
            "llm_span" => Some(Self::LlmSpan),
            "all_span" => Some(Self::AllSpan),
            _ => None,
        }
    }
}

impl fmt::Display for SpanListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_serde_matches_as_str() {
        for platform in [
            PlatformType::Cozeloop,
            PlatformType::Prompt,
            PlatformType::Evaluator,
            PlatformType::EvaluationTarget,
        ] {
            let json = serde_json::to_string(&platform).unwrap();
            assert_eq!(json, format!("\"{}\"", platform.as_str()));
        }
    }

    #[test]
    fn test_span_list_type_parse() {
        assert_eq!(SpanListType::parse("llm_span"), Some(SpanListType::LlmSpan));
        assert_eq!(SpanListType::parse("llm"), None);
    }
}
