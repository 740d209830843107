//! Required/optional/excluded artifact path rules.

use regex::RegexSet;
use std::sync::OnceLock;

/// Artifacts every exported job must contain.
pub const REQUIRED_ARTIFACTS: [&str; 3] =
    ["results.yml", "eval_factory_metrics.json", "omni-info.json"];

/// Glob-style patterns excluded from full exports, case-insensitive.
pub const EXCLUDE_PATTERNS: [&str; 5] = ["*cache*", "*.db", "*.lock", "synthetic", "debug.json"];

fn exclusion_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        let regexes: Vec<String> = EXCLUDE_PATTERNS
            .iter()
            .map(|pattern| {
                let escaped = regex::escape(pattern).replace(r"\*", ".*");
                format!("(?i)^{}$", escaped)
            })
            .collect();
        RegexSet::new(regexes).expect("static patterns compile")
    })
}

/// Whether a file name matches any exclusion pattern.
pub fn is_excluded(name: &str) -> bool {
    exclusion_set().is_match(name)
}

/// The exclusion patterns as `tar --exclude=` arguments.
pub fn tar_exclude_args() -> Vec<String> {
    EXCLUDE_PATTERNS.iter().map(|p| format!("--exclude={}", p)).collect()
}
