//! Session state machine

use chrono::{DateTime, Local};
use dispensa_api::{SessionStatus, SessionStatusView};
use dispensa_config::LossPolicy;
use dispensa_store::SessionRecord;
use dispensa_util::{
    to_chrono, CaseId, MonotonicInstant, OwnerId, SessionId, SubjectId, TaskId,
    MAX_DURATION_BUDGET,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::{DeadlineHandle, SessionError, SessionResult, TaskGraph};

/// Timing of one attempt at a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTiming {
    /// Wall-clock start time (for display/persistence)
    pub started_at: DateTime<Local>,

    /// Monotonic start time (for enforcement)
    pub started_at_mono: MonotonicInstant,

    /// Wall-clock deadline (for display)
    pub deadline: DateTime<Local>,

    /// Monotonic deadline (for enforcement)
    pub deadline_mono: MonotonicInstant,

    /// Set once the attempt reaches Recovered or Lost
    pub ended_at: Option<DateTime<Local>>,

    pub ended_at_mono: Option<MonotonicInstant>,
}

impl AttemptTiming {
    /// Timing for an attempt starting now
    pub fn begin(
        budget: Duration,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<Self> {
        let deadline = now
            .checked_add_signed(to_chrono(budget))
            .ok_or(SessionError::InvalidBudget)?;
        let deadline_mono = now_mono
            .checked_add(budget)
            .ok_or(SessionError::InvalidBudget)?;

        Ok(Self {
            started_at: now,
            started_at_mono: now_mono,
            deadline,
            deadline_mono,
            ended_at: None,
            ended_at_mono: None,
        })
    }

    /// Rebuild timing from persisted wall-clock timestamps.
    ///
    /// Monotonic instants don't survive a restart, so they are re-derived from
    /// how far the wall-clock deadline is from `now`.
    pub fn rebase(
        started_at: DateTime<Local>,
        ended_at: Option<DateTime<Local>>,
        budget: Duration,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<Self> {
        let deadline = started_at
            .checked_add_signed(to_chrono(budget))
            .ok_or(SessionError::InvalidBudget)?;
        let until_deadline = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        let deadline_mono = now_mono
            .checked_add(until_deadline)
            .ok_or(SessionError::InvalidBudget)?;
        let started_at_mono = deadline_mono.checked_sub(budget).unwrap_or(now_mono);

        let ended_at_mono = ended_at.map(|end| {
            let ran = (end - started_at).to_std().unwrap_or(Duration::ZERO);
            started_at_mono.checked_add(ran).unwrap_or(now_mono)
        });

        Ok(Self {
            started_at,
            started_at_mono,
            deadline,
            deadline_mono,
            ended_at,
            ended_at_mono,
        })
    }

    fn end(&mut self, now: DateTime<Local>, now_mono: MonotonicInstant) {
        self.ended_at = Some(now);
        self.ended_at_mono = Some(now_mono);
    }

    /// Time spent in this attempt, frozen once it ended
    pub fn elapsed(&self, now_mono: MonotonicInstant) -> Duration {
        self.ended_at_mono
            .unwrap_or(now_mono)
            .duration_since(self.started_at_mono)
    }

    /// Time left before the deadline (zero once passed), frozen once ended
    pub fn remaining(&self, now_mono: MonotonicInstant) -> Duration {
        self.deadline_mono
            .saturating_duration_until(self.ended_at_mono.unwrap_or(now_mono))
    }

    pub fn is_due(&self, now_mono: MonotonicInstant) -> bool {
        now_mono >= self.deadline_mono
    }
}

/// Result of reporting a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task was already done; nothing changed
    AlreadyCompleted,
    /// Task recorded, more remain
    Recorded,
    /// Task recorded and it was the last one: the session is now Recovered
    Finished,
}

/// Non-zero and no longer than [`MAX_DURATION_BUDGET`]
pub fn is_valid_budget(budget: Duration) -> bool {
    !budget.is_zero() && budget <= MAX_DURATION_BUDGET
}

/// One timed training session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub subject_id: SubjectId,
    pub case_id: Option<CaseId>,
    pub tasks: Arc<TaskGraph>,
    pub duration_budget: Duration,
    pub status: SessionStatus,
    pub completed: HashSet<TaskId>,

    /// Current attempt, `None` while Waiting
    pub timing: Option<AttemptTiming>,

    /// 1 after start, +1 per recovery
    pub attempt: u32,

    /// Recovery tokens this session consumed
    pub recoveries: u32,

    /// Bumped on every mutation
    pub version: u64,

    /// Armed deadline of the current attempt (not persisted)
    pub deadline: Option<DeadlineHandle>,
}

impl Session {
    /// New session in `Waiting`
    pub fn new(
        owner_id: OwnerId,
        subject_id: SubjectId,
        case_id: Option<CaseId>,
        duration_budget: Duration,
        tasks: Arc<TaskGraph>,
    ) -> SessionResult<Self> {
        if !is_valid_budget(duration_budget) {
            return Err(SessionError::InvalidBudget);
        }

        Ok(Self {
            id: SessionId::new(),
            owner_id,
            subject_id,
            case_id,
            tasks,
            duration_budget,
            status: SessionStatus::Waiting,
            completed: HashSet::new(),
            timing: None,
            attempt: 0,
            recoveries: 0,
            version: 1,
            deadline: None,
        })
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Waiting -> Active
    pub fn start(
        &mut self,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<AttemptTiming> {
        if self.status != SessionStatus::Waiting {
            return Err(SessionError::AlreadyStarted);
        }

        let timing = AttemptTiming::begin(self.duration_budget, now, now_mono)?;
        self.timing = Some(timing);
        self.status = SessionStatus::Active;
        self.attempt += 1;
        self.touch();

        Ok(timing)
    }

    /// Record a finished subtask; finalizes to Recovered when it was the last one
    pub fn complete_task(
        &mut self,
        task: &TaskId,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<TaskOutcome> {
        if !self.tasks.contains(task) {
            return Err(SessionError::UnknownTask);
        }

        if self.completed.contains(task)
            && matches!(self.status, SessionStatus::Active | SessionStatus::Recovered)
        {
            return Ok(TaskOutcome::AlreadyCompleted);
        }

        if self.status != SessionStatus::Active {
            return Err(SessionError::SessionNotActive);
        }

        self.completed.insert(task.clone());
        self.touch();

        if self.tasks.is_complete(&self.completed) {
            if let Some(timing) = &mut self.timing {
                timing.end(now, now_mono);
            }
            self.status = SessionStatus::Recovered;
            return Ok(TaskOutcome::Finished);
        }

        Ok(TaskOutcome::Recorded)
    }

    /// Active -> Lost. Returns false (and changes nothing) in any other state.
    pub fn expire(
        &mut self,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
        policy: LossPolicy,
    ) -> bool {
        if self.status != SessionStatus::Active {
            return false;
        }

        if let Some(timing) = &mut self.timing {
            timing.end(now, now_mono);
        }
        self.status = SessionStatus::Lost;
        if policy == LossPolicy::Clear {
            self.completed.clear();
        }
        self.touch();

        true
    }

    /// Check a recovery is possible and compute the fresh attempt's timing.
    ///
    /// Nothing changes until [`Session::resume`] is called with the result.
    pub fn prepare_resume(
        &self,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<AttemptTiming> {
        if self.status != SessionStatus::Lost {
            return Err(SessionError::NotLost);
        }
        AttemptTiming::begin(self.duration_budget, now, now_mono)
    }

    /// Lost -> Active with a fresh deadline. Completed tasks are kept.
    pub fn resume(&mut self, timing: AttemptTiming) {
        debug_assert_eq!(self.status, SessionStatus::Lost);

        self.timing = Some(timing);
        self.status = SessionStatus::Active;
        self.attempt += 1;
        self.recoveries += 1;
        self.touch();
    }

    /// Active and past its deadline
    pub fn is_due(&self, now_mono: MonotonicInstant) -> bool {
        self.status == SessionStatus::Active
            && self.timing.is_some_and(|t| t.is_due(now_mono))
    }

    pub fn deadline_mono(&self) -> Option<MonotonicInstant> {
        self.timing.map(|t| t.deadline_mono)
    }

    pub fn elapsed(&self, now_mono: MonotonicInstant) -> Duration {
        self.timing
            .map(|t| t.elapsed(now_mono))
            .unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self, now_mono: MonotonicInstant) -> Duration {
        match (self.status, &self.timing) {
            (SessionStatus::Waiting, _) | (_, None) => self.duration_budget,
            (SessionStatus::Lost, Some(_)) => Duration::ZERO,
            (_, Some(timing)) => timing.remaining(now_mono),
        }
    }

    /// Completed task ids, sorted
    pub fn completed_sorted(&self) -> Vec<TaskId> {
        let mut tasks: Vec<_> = self.completed.iter().cloned().collect();
        tasks.sort();
        tasks
    }

    pub fn view(&self, now_mono: MonotonicInstant, tokens_remaining: u32) -> SessionStatusView {
        SessionStatusView {
            session_id: self.id,
            owner_id: self.owner_id.clone(),
            subject_id: self.subject_id.clone(),
            case_id: self.case_id.clone(),
            status: self.status,
            attempt: self.attempt,
            started_at: self.timing.map(|t| t.started_at),
            deadline: self.timing.map(|t| t.deadline),
            duration_budget: self.duration_budget,
            elapsed: self.elapsed(now_mono),
            remaining: self.remaining(now_mono),
            completed_tasks: self.completed_sorted(),
            required_tasks: self.tasks.required(),
            recovery_tokens_remaining: tokens_remaining,
        }
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id,
            owner_id: self.owner_id.clone(),
            subject_id: self.subject_id.clone(),
            case_id: self.case_id.clone(),
            status: self.status,
            duration_budget: self.duration_budget,
            started_at: self.timing.map(|t| t.started_at),
            ended_at: self.timing.and_then(|t| t.ended_at),
            completed_tasks: self.completed_sorted(),
            tasks: self.tasks.to_record(),
            attempt: self.attempt,
            recoveries: self.recoveries,
            version: self.version,
        }
    }

    /// Rebuild a session from its persisted record
    pub fn from_record(
        record: SessionRecord,
        now: DateTime<Local>,
        now_mono: MonotonicInstant,
    ) -> SessionResult<Self> {
        if !is_valid_budget(record.duration_budget) {
            return Err(SessionError::InvalidBudget);
        }

        let tasks = TaskGraph::from_record(record.tasks)?;
        let timing = record
            .started_at
            .map(|started| {
                AttemptTiming::rebase(started, record.ended_at, record.duration_budget, now, now_mono)
            })
            .transpose()?;

        Ok(Self {
            id: record.session_id,
            owner_id: record.owner_id,
            subject_id: record.subject_id,
            case_id: record.case_id,
            tasks: Arc::new(tasks),
            duration_budget: record.duration_budget,
            status: record.status,
            completed: record.completed_tasks.into_iter().collect(),
            timing,
            attempt: record.attempt,
            recoveries: record.recoveries,
            version: record.version,
            deadline: None,
        })
    }
}
