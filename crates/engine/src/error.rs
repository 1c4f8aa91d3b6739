// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

/// The error taxonomy the engine surfaces across its component boundaries.
///
/// Internal plumbing (runtime loading, client I/O) uses `anyhow::Result`
/// with `.context(...)`; this enum is the narrower set of conditions a
/// caller of the engine crate needs to branch on.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required field was missing or of the wrong kind on a rule
    /// configuration or request envelope.
    #[error("config error: {0}")]
    Config(String),

    /// The rule component failed to compile or instantiate.
    #[error("rule `{rule_id}` failed to compile: {source}")]
    Compile {
        rule_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A rule/title/dedup/alert_context export raised at runtime.
    #[error("{function}: {message}")]
    RuleExec { function: &'static str, message: String },

    /// An input line could not be parsed as JSON.
    #[error("event is not valid JSON: {0}")]
    Parse(String),

    /// Control-plane, KV store, object store, or pub/sub I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl EngineError {
    /// Formats a caught exception-equivalent the way the direct-test
    /// response contract requires: `"<Kind>: <message>"`.
    pub fn as_formatted(&self) -> String {
        match self {
            EngineError::Config(m) => format!("ConfigError: {m}"),
            EngineError::Compile { source, .. } => format!("CompileError: {source}"),
            EngineError::RuleExec { function, message } => format!("{function}: {message}"),
            EngineError::Parse(m) => format!("ParseError: {m}"),
            EngineError::Transport(e) => format!("TransportError: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_prefixed() {
        let err = EngineError::Config("rule is missing required field `id`".to_string());
        assert_eq!(
            err.as_formatted(),
            "ConfigError: rule is missing required field `id`"
        );
    }

    #[test]
    fn rule_exec_error_uses_the_function_label_verbatim() {
        let err = EngineError::RuleExec {
            function: "dedup",
            message: "d".to_string(),
        };
        assert_eq!(err.as_formatted(), "dedup: d");
    }
}
