// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::OnceLock;

fn rule_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9 .\-]+$").unwrap())
}

/// Validates that a rule id is safe to use as a filesystem-facing name,
/// matching the allowed character set `[A-Za-z0-9 .-]+`.
pub fn ensure_valid_rule_id(rule_id: &str) -> Result<()> {
    if rule_id.is_empty() || !rule_id_pattern().is_match(rule_id) {
        bail!(
            "rule id `{}` must match [A-Za-z0-9 .-]+ and be non-empty",
            rule_id
        );
    }
    Ok(())
}

/// Truncates `s` to at most `max_len` characters, appending the standard
/// `"... (truncated)"` suffix when truncation occurs. Mirrors the scheme
/// applied identically to rule titles and dedup strings.
pub fn truncate_with_suffix(s: &str, max_len: usize) -> String {
    const SUFFIX: &str = "... (truncated)";
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(SUFFIX.chars().count());
    let truncated: String = s.chars().take(keep).collect();
    format!("{truncated}{SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(ensure_valid_rule_id("AWS.CloudTrail-Log Validation").is_ok());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(ensure_valid_rule_id("../etc/passwd").is_err());
        assert!(ensure_valid_rule_id("").is_err());
    }

    #[test]
    fn rejects_underscores_outside_the_allowed_character_set() {
        // The reserved shared-module id "aws_globals" deliberately falls
        // outside [A-Za-z0-9 .-]+ — it is never routed through this
        // validator (cache::Engine::refresh_if_stale skips it before
        // calling Rule::load).
        assert!(ensure_valid_rule_id("aws_globals").is_err());
    }

    #[test]
    fn truncates_to_exact_length() {
        let long = "a".repeat(1001);
        let out = truncate_with_suffix(&long, 1000);
        assert_eq!(out.chars().count(), 1000);
        assert!(out.ends_with("... (truncated)"));
    }

    #[test]
    fn leaves_short_strings_untouched() {
        assert_eq!(truncate_with_suffix("short", 1000), "short");
    }
}
