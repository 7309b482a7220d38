//! Session service facade

use dispensa_api::{RecoveryBudget, SessionStatusView};
use dispensa_config::{CaseDefinition, ServiceConfig};
use dispensa_store::{Store, StoreResult};
use dispensa_util::{Clock, OwnerId, SessionId, SubjectId, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    is_valid_counselling, DeadlineScheduler, EventSink, RecoveryLedger, SessionError,
    SessionResult, SessionStore, TaskGraph, TaskOutcome,
};

/// The public face of the session engine
pub struct SessionService {
    sessions: Arc<SessionStore>,
    ledger: Arc<RecoveryLedger>,
    scheduler: DeadlineScheduler,
    store: Arc<dyn Store>,
    poll: Duration,
}

impl SessionService {
    /// Create the service, loading the persisted recovery ledger
    pub fn new(
        config: &ServiceConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let ledger = Arc::new(RecoveryLedger::new(config.max_recovery_tokens));
        match store.load_ledger() {
            Ok(entries) => ledger.hydrate(entries),
            Err(e) => warn!(error = %e, "Failed to load recovery ledger"),
        }

        let scheduler = DeadlineScheduler::new(clock.clone());
        let sessions = Arc::new(SessionStore::new(
            scheduler.clone(),
            ledger.clone(),
            store.clone(),
            sink,
            clock,
            config.progress_on_loss,
        ));

        info!(
            max_recovery_tokens = config.max_recovery_tokens,
            owners = ledger.owner_count(),
            "Session service initialized"
        );

        Self {
            sessions,
            ledger,
            scheduler,
            store,
            poll: config.scheduler_poll,
        }
    }

    /// Reload persisted sessions. Returns how many were restored.
    pub fn restore(&self) -> StoreResult<usize> {
        let records = self.store.load_sessions()?;
        Ok(self.sessions.restore(records))
    }

    /// Start the background deadline loop
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        self.scheduler
            .spawn(Arc::downgrade(&self.sessions), self.poll)
    }

    /// Fire every passed deadline now. Returns how many fired.
    pub fn fire_due_deadlines(&self) -> usize {
        self.scheduler.fire_due(self.sessions.as_ref())
    }

    pub fn create_session(
        &self,
        owner_id: OwnerId,
        subject_id: SubjectId,
        duration_budget: Duration,
        tasks: TaskGraph,
    ) -> SessionResult<SessionId> {
        self.sessions
            .create(owner_id, subject_id, None, duration_budget, Arc::new(tasks))
    }

    /// Create a session from a catalog case
    pub fn create_session_for_case(
        &self,
        owner_id: OwnerId,
        subject_id: SubjectId,
        case: &CaseDefinition,
    ) -> SessionResult<SessionId> {
        let tasks = TaskGraph::from_case(case)?;
        self.sessions.create(
            owner_id,
            subject_id,
            Some(case.id.clone()),
            case.duration_budget,
            Arc::new(tasks),
        )
    }

    pub fn start(&self, session_id: &SessionId) -> SessionResult<()> {
        self.sessions.start(session_id)
    }

    /// Mark a dispense or billing task done.
    ///
    /// The counsel task needs instructions and only completes via [`SessionService::counsel`].
    pub fn complete_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
    ) -> SessionResult<TaskOutcome> {
        let tasks = self.sessions.tasks(session_id)?;
        if task_id == tasks.counsel() {
            return Err(SessionError::InvalidCounselling);
        }

        self.sessions.complete_task(session_id, task_id)
    }

    /// Complete the counsel task, provided the instructions are acceptable
    pub fn counsel<S: AsRef<str>>(
        &self,
        session_id: &SessionId,
        instructions: &[S],
    ) -> SessionResult<TaskOutcome> {
        let tasks = self.sessions.tasks(session_id)?;

        if !is_valid_counselling(instructions) {
            return Err(SessionError::InvalidCounselling);
        }

        self.sessions.complete_task(session_id, tasks.counsel())
    }

    /// Spend a recovery token on a lost session. Returns tokens left.
    pub fn recover(&self, session_id: &SessionId) -> SessionResult<u32> {
        self.sessions.recover(session_id)
    }

    pub fn get_status(&self, session_id: &SessionId) -> SessionResult<SessionStatusView> {
        self.sessions.status(session_id)
    }

    pub fn recovery_budget(&self, owner_id: &OwnerId) -> RecoveryBudget {
        RecoveryBudget {
            remaining: self.ledger.remaining(owner_id),
            max_tokens: self.ledger.max_tokens(),
        }
    }

    pub fn pending_deadlines(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn is_store_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn scheduler(&self) -> &DeadlineScheduler {
        &self.scheduler
    }
}
