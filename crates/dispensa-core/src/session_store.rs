//! Session registry and transition driver

use dispensa_api::{SessionStatus, SessionStatusView};
use dispensa_config::LossPolicy;
use dispensa_store::{AuditEvent, AuditEventType, SessionRecord, Store};
use dispensa_util::{CaseId, Clock, MonotonicInstant, OwnerId, SessionId, SubjectId, TaskId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    CoreEvent, DeadlineScheduler, EventSink, ExpiryHandler, RecoveryLedger, Session,
    SessionError, SessionResult, TaskGraph, TaskOutcome,
};

/// Side effects of a transition, applied after the session lock is released
#[derive(Default)]
struct Effects {
    record: Option<SessionRecord>,
    ledger_owner: Option<OwnerId>,
    audits: Vec<AuditEventType>,
    events: Vec<CoreEvent>,
}

impl Effects {
    fn persist(session: &Session) -> Self {
        Self {
            record: Some(session.to_record()),
            ..Self::default()
        }
    }

    fn lost(session: &Session) -> Self {
        let mut effects = Self::persist(session);
        effects.audits.push(AuditEventType::SessionLost {
            session_id: session.id,
        });
        effects.events.push(CoreEvent::SessionLost {
            session_id: session.id,
            owner_id: session.owner_id.clone(),
        });
        effects
    }
}

/// Owns every session and applies the transition rules.
///
/// Each session sits behind its own mutex: operations on one session are
/// serialized, operations on different sessions only share a brief read of
/// the map.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    scheduler: DeadlineScheduler,
    ledger: Arc<RecoveryLedger>,
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    loss_policy: LossPolicy,
}

impl SessionStore {
    pub fn new(
        scheduler: DeadlineScheduler,
        ledger: Arc<RecoveryLedger>,
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        loss_policy: LossPolicy,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            scheduler,
            ledger,
            store,
            sink,
            clock,
            loss_policy,
        }
    }

    fn entry(&self, session_id: &SessionId) -> SessionResult<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or(SessionError::UnknownSession)
    }

    fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
        session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, session: Session) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, Arc::new(Mutex::new(session)));
    }

    /// Schedule the current attempt's deadline, replacing any earlier one
    fn arm(&self, session: &mut Session, deadline: MonotonicInstant) {
        let handle = self.scheduler.schedule(session.id, session.attempt, deadline);
        session.deadline = Some(handle);
    }

    fn disarm(&self, session: &mut Session) {
        if let Some(handle) = session.deadline.take() {
            self.scheduler.cancel_handle(&handle);
        }
    }

    fn apply(&self, effects: Effects) {
        if let Some(record) = effects.record {
            if let Err(e) = self.store.save_session(&record) {
                warn!(session_id = %record.session_id, error = %e, "Failed to persist session");
            }
        }

        if let Some(owner) = effects.ledger_owner {
            let consumed = self.ledger.consumed(&owner);
            if let Err(e) = self.store.set_tokens_consumed(&owner, consumed) {
                warn!(owner_id = %owner, error = %e, "Failed to persist recovery ledger");
            }
        }

        let now = self.clock.now_wall();
        for audit in effects.audits {
            if let Err(e) = self.store.append_audit(AuditEvent::at(now, audit)) {
                warn!(error = %e, "Failed to append audit event");
            }
        }

        for event in effects.events {
            self.sink.notify(event);
        }
    }

    /// Register a new session in `Waiting`
    pub fn create(
        &self,
        owner_id: OwnerId,
        subject_id: SubjectId,
        case_id: Option<CaseId>,
        duration_budget: Duration,
        tasks: Arc<TaskGraph>,
    ) -> SessionResult<SessionId> {
        let session = Session::new(owner_id, subject_id, case_id, duration_budget, tasks)?;
        let session_id = session.id;

        let mut effects = Effects::persist(&session);
        effects.audits.push(AuditEventType::SessionCreated {
            session_id,
            owner_id: session.owner_id.clone(),
            subject_id: session.subject_id.clone(),
        });

        info!(
            session_id = %session_id,
            owner_id = %session.owner_id,
            budget_secs = duration_budget.as_secs(),
            "Session created"
        );

        self.insert(session);
        self.apply(effects);

        Ok(session_id)
    }

    /// Waiting -> Active, arming the deadline
    pub fn start(&self, session_id: &SessionId) -> SessionResult<()> {
        let entry = self.entry(session_id)?;

        let effects = {
            let mut session = Self::lock(&entry);
            let timing = session.start(self.clock.now_wall(), self.clock.now_mono())?;
            self.arm(&mut session, timing.deadline_mono);

            info!(
                session_id = %session.id,
                deadline = %timing.deadline,
                "Session started"
            );

            let mut effects = Effects::persist(&session);
            effects.audits.push(AuditEventType::SessionStarted {
                session_id: session.id,
                deadline: timing.deadline,
            });
            effects.events.push(CoreEvent::SessionStarted {
                session_id: session.id,
                owner_id: session.owner_id.clone(),
                deadline: timing.deadline,
            });
            effects
        };

        self.apply(effects);
        Ok(())
    }

    /// Record a finished subtask; the last one finalizes the session
    pub fn complete_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
    ) -> SessionResult<TaskOutcome> {
        let entry = self.entry(session_id)?;

        let (outcome, effects) = {
            let mut session = Self::lock(&entry);
            let now_mono = self.clock.now_mono();

            // A report arriving after the deadline loses to it
            if let Some(lost) = self.expire_if_due_locked(&mut session, now_mono) {
                drop(session);
                self.apply(lost);
                return Err(SessionError::SessionNotActive);
            }

            let outcome = session.complete_task(task_id, self.clock.now_wall(), now_mono)?;

            if outcome == TaskOutcome::AlreadyCompleted {
                debug!(session_id = %session.id, task_id = %task_id, "Task already completed");
                return Ok(outcome);
            }

            let mut effects = Effects::persist(&session);
            effects.audits.push(AuditEventType::TaskCompleted {
                session_id: session.id,
                task_id: task_id.clone(),
            });
            effects.events.push(CoreEvent::TaskCompleted {
                session_id: session.id,
                task_id: task_id.clone(),
            });

            if outcome == TaskOutcome::Finished {
                self.disarm(&mut session);

                let elapsed = session.elapsed(now_mono);
                info!(
                    session_id = %session.id,
                    elapsed_secs = elapsed.as_secs(),
                    "Session recovered"
                );

                effects.audits.push(AuditEventType::SessionRecovered {
                    session_id: session.id,
                    elapsed,
                });
                effects.events.push(CoreEvent::SessionRecovered {
                    session_id: session.id,
                    owner_id: session.owner_id.clone(),
                    elapsed,
                });
            }

            (outcome, effects)
        };

        self.apply(effects);
        Ok(outcome)
    }

    fn expire_locked(&self, session: &mut Session) -> Option<Effects> {
        if !session.expire(self.clock.now_wall(), self.clock.now_mono(), self.loss_policy) {
            return None;
        }

        self.disarm(session);
        info!(session_id = %session.id, attempt = session.attempt, "Session lost");

        Some(Effects::lost(session))
    }

    fn expire_if_due_locked(
        &self,
        session: &mut Session,
        now_mono: MonotonicInstant,
    ) -> Option<Effects> {
        if !session.is_due(now_mono) {
            return None;
        }
        debug!(session_id = %session.id, "Deadline passed before the scheduler fired");
        self.expire_locked(session)
    }

    /// Expire the session only if it is Active and past its deadline
    pub fn expire_if_due(&self, session_id: &SessionId) -> SessionResult<bool> {
        let entry = self.entry(session_id)?;

        let effects = {
            let mut session = Self::lock(&entry);
            self.expire_if_due_locked(&mut session, self.clock.now_mono())
        };

        match effects {
            Some(effects) => {
                self.apply(effects);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Active -> Lost. A no-op returning `false` in any other state.
    pub fn expire(&self, session_id: &SessionId) -> SessionResult<bool> {
        let entry = self.entry(session_id)?;

        let effects = {
            let mut session = Self::lock(&entry);
            self.expire_locked(&mut session)
        };

        match effects {
            Some(effects) => {
                self.apply(effects);
                Ok(true)
            }
            None => {
                debug!(session_id = %session_id, "Expiry ignored, session not active");
                Ok(false)
            }
        }
    }

    /// Deadline callback: only the attempt that armed the timer may expire
    fn expire_attempt(&self, session_id: &SessionId, attempt: u32) {
        let Ok(entry) = self.entry(session_id) else {
            debug!(session_id = %session_id, "Deadline for unknown session");
            return;
        };

        let effects = {
            let mut session = Self::lock(&entry);
            if session.attempt != attempt {
                debug!(
                    session_id = %session_id,
                    attempt,
                    current_attempt = session.attempt,
                    "Stale deadline ignored"
                );
                return;
            }
            self.expire_locked(&mut session)
        };

        if let Some(effects) = effects {
            self.apply(effects);
        }
    }

    /// Lost -> Active, paid for with one of the owner's recovery tokens.
    ///
    /// Returns the owner's remaining tokens.
    pub fn recover(&self, session_id: &SessionId) -> SessionResult<u32> {
        let entry = self.entry(session_id)?;

        let (lost, result) = {
            let mut session = Self::lock(&entry);
            let now_mono = self.clock.now_mono();
            let lost = self.expire_if_due_locked(&mut session, now_mono);

            let timing = match session.prepare_resume(self.clock.now_wall(), now_mono) {
                Ok(timing) => timing,
                Err(e) => {
                    drop(session);
                    if let Some(lost) = lost {
                        self.apply(lost);
                    }
                    return Err(e);
                }
            };
            let grant = self.ledger.try_consume(&session.owner_id);

            if grant.granted {
                session.resume(timing);
                self.arm(&mut session, timing.deadline_mono);

                info!(
                    session_id = %session.id,
                    owner_id = %session.owner_id,
                    attempt = session.attempt,
                    tokens_remaining = grant.remaining,
                    "Session resumed"
                );

                let mut effects = Effects::persist(&session);
                effects.ledger_owner = Some(session.owner_id.clone());
                effects.audits.push(AuditEventType::SessionResumed {
                    session_id: session.id,
                    owner_id: session.owner_id.clone(),
                    tokens_remaining: grant.remaining,
                });
                effects.events.push(CoreEvent::SessionResumed {
                    session_id: session.id,
                    owner_id: session.owner_id.clone(),
                    deadline: timing.deadline,
                    tokens_remaining: grant.remaining,
                });
                (lost, Ok((grant.remaining, effects)))
            } else {
                info!(
                    session_id = %session.id,
                    owner_id = %session.owner_id,
                    "Recovery denied, no tokens left"
                );

                let mut effects = Effects::default();
                effects.audits.push(AuditEventType::RecoveryDenied {
                    session_id: session.id,
                    owner_id: session.owner_id.clone(),
                });
                (lost, Err((grant.remaining, effects)))
            }
        };

        if let Some(lost) = lost {
            self.apply(lost);
        }

        match result {
            Ok((remaining, effects)) => {
                self.apply(effects);
                Ok(remaining)
            }
            Err((remaining, effects)) => {
                self.apply(effects);
                Err(SessionError::RecoveryDenied { remaining })
            }
        }
    }

    /// Current view of a session.
    ///
    /// An `Active` session already past its deadline is expired first, so a
    /// lagging scheduler is never observable.
    pub fn status(&self, session_id: &SessionId) -> SessionResult<SessionStatusView> {
        let entry = self.entry(session_id)?;

        let (view, effects) = {
            let mut session = Self::lock(&entry);
            let now_mono = self.clock.now_mono();

            let effects = self.expire_if_due_locked(&mut session, now_mono);

            let view = session.view(now_mono, self.ledger.remaining(&session.owner_id));
            (view, effects)
        };

        if let Some(effects) = effects {
            self.apply(effects);
        }

        Ok(view)
    }

    /// Task graph of a session
    pub fn tasks(&self, session_id: &SessionId) -> SessionResult<Arc<TaskGraph>> {
        let entry = self.entry(session_id)?;
        let session = Self::lock(&entry);
        Ok(session.tasks.clone())
    }

    /// Copy of the session as it is right now
    pub fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        let entry = self.entry(session_id).ok()?;
        let session = Self::lock(&entry);
        Some(session.clone())
    }

    /// Load persisted sessions, re-arming deadlines of active ones.
    ///
    /// Returns how many sessions were restored.
    pub fn restore(&self, records: impl IntoIterator<Item = SessionRecord>) -> usize {
        let now = self.clock.now_wall();
        let now_mono = self.clock.now_mono();
        let mut restored = 0;

        for record in records {
            let session_id = record.session_id;

            if record.status != SessionStatus::Waiting && record.started_at.is_none() {
                warn!(session_id = %session_id, status = %record.status, "Skipping session without a start time");
                continue;
            }

            let mut session = match Session::from_record(record, now, now_mono) {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Skipping unrestorable session");
                    continue;
                }
            };

            if session.status == SessionStatus::Active {
                if let Some(deadline) = session.deadline_mono() {
                    self.arm(&mut session, deadline);
                }
            }

            self.insert(session);
            restored += 1;
        }

        info!(count = restored, "Sessions restored");
        restored
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExpiryHandler for SessionStore {
    fn on_deadline(&self, session_id: &SessionId, attempt: u32) {
        self.expire_attempt(session_id, attempt);
    }
}
