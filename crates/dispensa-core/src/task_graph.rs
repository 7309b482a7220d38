//! Task graphs: the subtasks a session needs before it can close

use dispensa_api::TaskStage;
use dispensa_config::CaseDefinition;
use dispensa_store::TaskGraphRecord;
use dispensa_util::TaskId;
use std::collections::HashSet;

use crate::TaskGraphError;

/// Sentinel instruction meaning "no counselling needed"
pub const NO_COUNSELLING: &str = "none";

/// Required subtasks for one case type
///
/// Shared by every session of that case. A session is complete once every
/// dispense task, the counsel task and the billing task have been reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraph {
    dispense: Vec<TaskId>,
    counsel: TaskId,
    billing: TaskId,
}

impl TaskGraph {
    pub fn new(
        dispense: Vec<TaskId>,
        counsel: TaskId,
        billing: TaskId,
    ) -> Result<Self, TaskGraphError> {
        let mut seen = HashSet::new();
        for id in dispense.iter().chain([&counsel, &billing]) {
            if id.as_str().trim().is_empty() {
                return Err(TaskGraphError::BlankTaskId);
            }
            if !seen.insert(id) {
                return Err(TaskGraphError::DuplicateTask(id.clone()));
            }
        }

        Ok(Self {
            dispense,
            counsel,
            billing,
        })
    }

    pub fn from_case(case: &CaseDefinition) -> Result<Self, TaskGraphError> {
        Self::new(
            case.dispense.clone(),
            case.counsel.clone(),
            case.billing.clone(),
        )
    }

    pub fn from_record(record: TaskGraphRecord) -> Result<Self, TaskGraphError> {
        Self::new(record.dispense, record.counsel, record.billing)
    }

    pub fn to_record(&self) -> TaskGraphRecord {
        TaskGraphRecord {
            dispense: self.dispense.clone(),
            counsel: self.counsel.clone(),
            billing: self.billing.clone(),
        }
    }

    pub fn dispense(&self) -> &[TaskId] {
        &self.dispense
    }

    pub fn counsel(&self) -> &TaskId {
        &self.counsel
    }

    pub fn billing(&self) -> &TaskId {
        &self.billing
    }

    /// All required ids in stage order
    pub fn required(&self) -> Vec<TaskId> {
        self.dispense
            .iter()
            .chain([&self.counsel, &self.billing])
            .cloned()
            .collect()
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.stage_of(task).is_some()
    }

    pub fn stage_of(&self, task: &TaskId) -> Option<TaskStage> {
        if self.dispense.contains(task) {
            Some(TaskStage::Dispense)
        } else if &self.counsel == task {
            Some(TaskStage::Counsel)
        } else if &self.billing == task {
            Some(TaskStage::Billing)
        } else {
            None
        }
    }

    /// True iff `completed` covers every required task
    pub fn is_complete(&self, completed: &HashSet<TaskId>) -> bool {
        self.dispense.iter().all(|t| completed.contains(t))
            && completed.contains(&self.counsel)
            && completed.contains(&self.billing)
    }
}

/// Whether a set of counselling instructions satisfies the counsel task.
///
/// Valid: one or more non-blank instructions, or [`NO_COUNSELLING`] alone.
pub fn is_valid_counselling<S: AsRef<str>>(instructions: &[S]) -> bool {
    let is_sentinel = |s: &str| s.trim().eq_ignore_ascii_case(NO_COUNSELLING);

    match instructions {
        [] => false,
        [only] if is_sentinel(only.as_ref()) => true,
        many => many.iter().all(|i| {
            let i = i.as_ref();
            !i.trim().is_empty() && !is_sentinel(i)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> TaskGraph {
        TaskGraph::new(
            vec![
                TaskId::new("dispense:nitrofurantoin-100"),
                TaskId::new("dispense:paracetamol-500"),
            ],
            TaskId::new("counsel"),
            TaskId::new("billing"),
        )
        .unwrap()
    }

    #[test]
    fn test_completion_requires_every_stage() {
        let graph = graph();
        let mut done = HashSet::new();

        for task in graph.required() {
            assert!(!graph.is_complete(&done));
            done.insert(task);
        }
        assert!(graph.is_complete(&done));
    }

    #[test]
    fn test_extra_tasks_do_not_complete() {
        let graph = graph();
        let done: HashSet<_> = [TaskId::new("counsel"), TaskId::new("billing"), TaskId::new("other")]
            .into_iter()
            .collect();
        assert!(!graph.is_complete(&done));
    }

    #[test]
    fn test_no_dispense_items() {
        let graph = TaskGraph::new(vec![], TaskId::new("counsel"), TaskId::new("billing")).unwrap();
        let done: HashSet<_> = [TaskId::new("counsel"), TaskId::new("billing")].into_iter().collect();
        assert!(graph.is_complete(&done));
        assert_eq!(graph.required().len(), 2);
    }

    #[test]
    fn test_stage_lookup() {
        let graph = graph();
        assert_eq!(
            graph.stage_of(&TaskId::new("dispense:paracetamol-500")),
            Some(TaskStage::Dispense)
        );
        assert_eq!(graph.stage_of(&TaskId::new("counsel")), Some(TaskStage::Counsel));
        assert_eq!(graph.stage_of(&TaskId::new("billing")), Some(TaskStage::Billing));
        assert!(!graph.contains(&TaskId::new("dispense:ibuprofen-200")));
    }

    #[test]
    fn test_rejects_bad_graphs() {
        assert_eq!(
            TaskGraph::new(vec![TaskId::new(" ")], TaskId::new("counsel"), TaskId::new("billing")),
            Err(TaskGraphError::BlankTaskId)
        );
        assert_eq!(
            TaskGraph::new(vec![], TaskId::new("done"), TaskId::new("done")),
            Err(TaskGraphError::DuplicateTask(TaskId::new("done")))
        );
    }

    #[test]
    fn test_record_round_trip_keeps_order() {
        let graph = graph();
        let restored = TaskGraph::from_record(graph.to_record()).unwrap();
        assert_eq!(restored.required(), graph.required());
    }

    #[test]
    fn test_counselling_rules() {
        assert!(is_valid_counselling(&["Take with food"]));
        assert!(is_valid_counselling(&["Take with food", "Finish the course"]));
        assert!(is_valid_counselling(&["none"]));
        assert!(is_valid_counselling(&[" None "]));

        let empty: [&str; 0] = [];
        assert!(!is_valid_counselling(&empty));
        assert!(!is_valid_counselling(&["   "]));
        assert!(!is_valid_counselling(&["Take with food", ""]));
        assert!(!is_valid_counselling(&["none", "Take with food"]));
    }
}
