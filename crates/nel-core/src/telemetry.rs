//! Telemetry env-var propagation.
//!
//! The launcher never emits telemetry itself; it forwards these variables
//! verbatim into every container/job when set in the caller's environment,
//! and omits them when not.

/// Variables forwarded into every container and remote job.
pub const TELEMETRY_ENV_VARS: [&str; 3] = [
    "NEMO_EVALUATOR_TELEMETRY_SESSION_ID",
    "NEMO_EVALUATOR_TELEMETRY_LEVEL",
    "NEMO_EVALUATOR_TELEMETRY_ENDPOINT",
];

/// The telemetry variables currently set in the process environment.
pub fn telemetry_env() -> Vec<(String, String)> {
    TELEMETRY_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_vars_are_omitted() {
        // Serialized env access; these names are unlikely to be set in CI.
        for name in TELEMETRY_ENV_VARS {
            std::env::remove_var(name);
        }
        assert!(telemetry_env().is_empty());

        std::env::set_var("NEMO_EVALUATOR_TELEMETRY_LEVEL", "1");
        let vars = telemetry_env();
        assert_eq!(vars, vec![("NEMO_EVALUATOR_TELEMETRY_LEVEL".to_string(), "1".to_string())]);
        std::env::remove_var("NEMO_EVALUATOR_TELEMETRY_LEVEL");
    }
}
