//! Validated catalog structures

use crate::schema::{RawCase, RawConfig, RawLossPolicy, RawServiceConfig};
use dispensa_util::{data_dir_without_env, socket_path_without_env, CaseId, TaskId};
use std::path::PathBuf;
use std::time::Duration;

/// Default counselling task id
pub const DEFAULT_COUNSEL_TASK: &str = "counsel";

/// Default billing task id
pub const DEFAULT_BILLING_TASK: &str = "billing";

/// Default recovery tokens per owner
pub const DEFAULT_MAX_RECOVERY_TOKENS: u32 = 50;

/// Default upper bound on scheduler sleeps
pub const DEFAULT_SCHEDULER_POLL: Duration = Duration::from_millis(100);

/// Task id for dispensing one prescribed item
pub fn dispense_task_id(item: &str) -> String {
    format!("dispense:{}", item.trim())
}

/// Validated catalog ready for use by the core
#[derive(Debug, Clone)]
pub struct Catalog {
    pub service: ServiceConfig,
    pub cases: Vec<CaseDefinition>,
}

impl Catalog {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            cases: raw.cases.into_iter().map(CaseDefinition::from_raw).collect(),
        }
    }

    /// Get case by ID
    pub fn get_case(&self, id: &CaseId) -> Option<&CaseDefinition> {
        self.cases.iter().find(|c| &c.id == id)
    }
}

/// What happens to a session's completed tasks when its deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossPolicy {
    /// Keep progress so a recovery resumes where the student left off
    #[default]
    Retain,
    /// Start over after a recovery
    Clear,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub max_recovery_tokens: u32,
    pub scheduler_poll: Duration,
    pub progress_on_loss: LossPolicy,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(socket_path_without_env),
            data_dir: raw.data_dir.unwrap_or_else(data_dir_without_env),
            max_recovery_tokens: raw
                .max_recovery_tokens
                .unwrap_or(DEFAULT_MAX_RECOVERY_TOKENS),
            scheduler_poll: raw
                .scheduler_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SCHEDULER_POLL),
            progress_on_loss: match raw.progress_on_loss {
                Some(RawLossPolicy::Clear) => LossPolicy::Clear,
                Some(RawLossPolicy::Retain) | None => LossPolicy::Retain,
            },
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Validated case definition
#[derive(Debug, Clone)]
pub struct CaseDefinition {
    pub id: CaseId,
    pub label: String,
    pub duration_budget: Duration,
    /// Dispense task ids, in prescription order
    pub dispense: Vec<TaskId>,
    pub counsel: TaskId,
    pub billing: TaskId,
}

impl CaseDefinition {
    fn from_raw(raw: RawCase) -> Self {
        Self {
            id: CaseId::new(raw.id),
            label: raw.label,
            duration_budget: Duration::from_secs(raw.duration_seconds),
            dispense: raw
                .dispense
                .iter()
                .map(|item| TaskId::new(dispense_task_id(item)))
                .collect(),
            counsel: TaskId::new(
                raw.counsel_task
                    .unwrap_or_else(|| DEFAULT_COUNSEL_TASK.to_string()),
            ),
            billing: TaskId::new(
                raw.billing_task
                    .unwrap_or_else(|| DEFAULT_BILLING_TASK.to_string()),
            ),
        }
    }

    /// All required task ids in stage order
    pub fn required_tasks(&self) -> Vec<TaskId> {
        self.dispense
            .iter()
            .chain([&self.counsel, &self.billing])
            .cloned()
            .collect()
    }
}
