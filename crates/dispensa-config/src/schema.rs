//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global service settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Case catalog
    #[serde(default)]
    pub cases: Vec<RawCase>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/dispensa/dispensad.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// Recovery tokens per owner (default: 50)
    pub max_recovery_tokens: Option<u32>,

    /// Upper bound on how long the deadline scheduler sleeps between polls
    pub scheduler_poll_ms: Option<u64>,

    /// What happens to completed tasks when a session is lost
    pub progress_on_loss: Option<RawLossPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawLossPolicy {
    Retain,
    Clear,
}

/// Raw case definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawCase {
    /// Unique stable ID
    pub id: String,

    /// Display label
    pub label: String,

    /// Time budget for one attempt
    pub duration_seconds: u64,

    /// Prescribed items, one dispense task each
    #[serde(default)]
    pub dispense: Vec<String>,

    /// Counselling task id (default: "counsel")
    pub counsel_task: Option<String>,

    /// Billing task id (default: "billing")
    pub billing_task: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_case() {
        let toml_str = r#"
            config_version = 1

            [[cases]]
            id = "uti-adult"
            label = "Adult UTI"
            duration_seconds = 300
            dispense = ["nitrofurantoin-100", "paracetamol-500"]
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cases.len(), 1);
        assert_eq!(config.cases[0].dispense.len(), 2);
        assert!(config.cases[0].counsel_task.is_none());
    }

    #[test]
    fn parse_service_settings() {
        let toml_str = r#"
            config_version = 1

            [service]
            max_recovery_tokens = 3
            progress_on_loss = "clear"
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.max_recovery_tokens, Some(3));
        assert_eq!(config.service.progress_on_loss, Some(RawLossPolicy::Clear));
        assert!(config.cases.is_empty());
    }

    #[test]
    fn reject_unknown_loss_policy() {
        let toml_str = r#"
            config_version = 1

            [service]
            progress_on_loss = "forget"
        "#;

        assert!(toml::from_str::<RawConfig>(toml_str).is_err());
    }
}
