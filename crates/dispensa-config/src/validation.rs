//! Configuration validation

use crate::catalog::{dispense_task_id, DEFAULT_BILLING_TASK, DEFAULT_COUNSEL_TASK};
use crate::schema::{RawCase, RawConfig};
use dispensa_util::{format_duration, MAX_DURATION_BUDGET};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Case '{case_id}': {message}")]
    CaseError { case_id: String, message: String },

    #[error("Duplicate case ID: {0}")]
    DuplicateCaseId(String),

    #[error("Case '{case_id}': task '{task_id}' appears more than once")]
    DuplicateTask { case_id: String, task_id: String },

    #[error("Service config error: {0}")]
    ServiceError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.service.scheduler_poll_ms == Some(0) {
        errors.push(ValidationError::ServiceError(
            "scheduler_poll_ms must be greater than zero".into(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for case in &config.cases {
        if !seen_ids.insert(&case.id) {
            errors.push(ValidationError::DuplicateCaseId(case.id.clone()));
        }
    }

    for case in &config.cases {
        errors.extend(validate_case(case));
    }

    errors
}

fn validate_case(case: &RawCase) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let case_error = |message: &str| ValidationError::CaseError {
        case_id: case.id.clone(),
        message: message.into(),
    };

    if case.id.trim().is_empty() {
        errors.push(case_error("id cannot be empty"));
    }

    if case.label.trim().is_empty() {
        errors.push(case_error("label cannot be empty"));
    }

    // A zero budget would lose every session the instant it starts
    if case.duration_seconds == 0 {
        errors.push(case_error("duration_seconds must be greater than zero"));
    } else if case.duration_seconds > MAX_DURATION_BUDGET.as_secs() {
        errors.push(case_error(&format!(
            "duration_seconds must be at most {} ({})",
            MAX_DURATION_BUDGET.as_secs(),
            format_duration(MAX_DURATION_BUDGET)
        )));
    }

    let counsel = case.counsel_task.as_deref().unwrap_or(DEFAULT_COUNSEL_TASK);
    let billing = case.billing_task.as_deref().unwrap_or(DEFAULT_BILLING_TASK);

    if counsel.trim().is_empty() {
        errors.push(case_error("counsel_task cannot be empty"));
    }
    if billing.trim().is_empty() {
        errors.push(case_error("billing_task cannot be empty"));
    }

    let mut task_ids = HashSet::new();
    for item in &case.dispense {
        if item.trim().is_empty() {
            errors.push(case_error("dispense items cannot be empty"));
            continue;
        }
        let task_id = dispense_task_id(item);
        if !task_ids.insert(task_id.clone()) {
            errors.push(ValidationError::DuplicateTask {
                case_id: case.id.clone(),
                task_id,
            });
        }
    }

    for task_id in [counsel, billing] {
        if !task_ids.insert(task_id.to_string()) {
            errors.push(ValidationError::DuplicateTask {
                case_id: case.id.clone(),
                task_id: task_id.to_string(),
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_case(id: &str, dispense: &[&str]) -> RawCase {
        RawCase {
            id: id.into(),
            label: format!("Case {id}"),
            duration_seconds: 300,
            dispense: dispense.iter().map(|s| s.to_string()).collect(),
            counsel_task: None,
            billing_task: None,
        }
    }

    fn make_config(cases: Vec<RawCase>) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: Default::default(),
            cases,
        }
    }

    #[test]
    fn valid_config_has_no_errors() {
        let config = make_config(vec![make_case("a", &["x", "y"]), make_case("b", &[])]);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_duplicate_id_detection() {
        let config = make_config(vec![make_case("a", &["x"]), make_case("a", &["y"])]);

        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateCaseId(_))));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut case = make_case("a", &["x"]);
        case.duration_seconds = 0;

        let errors = validate_config(&make_config(vec![case]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("duration_seconds"));
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let mut case = make_case("a", &["x"]);
        case.duration_seconds = MAX_DURATION_BUDGET.as_secs();
        assert!(validate_config(&make_config(vec![case.clone()])).is_empty());

        case.duration_seconds = u64::MAX;
        let errors = validate_config(&make_config(vec![case]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("at most"));
    }

    #[test]
    fn test_duplicate_dispense_item_rejected() {
        let errors = validate_config(&make_config(vec![make_case("a", &["x", "x"])]));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::DuplicateTask { task_id, .. } if task_id == "dispense:x"
        )));
    }

    #[test]
    fn test_counsel_and_billing_must_differ() {
        let mut case = make_case("a", &[]);
        case.counsel_task = Some("wrap-up".into());
        case.billing_task = Some("wrap-up".into());

        let errors = validate_config(&make_config(vec![case]));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateTask { .. })));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = make_config(vec![]);
        config.service.scheduler_poll_ms = Some(0);

        let errors = validate_config(&config);
        assert!(matches!(errors.as_slice(), [ValidationError::ServiceError(_)]));
    }
}
