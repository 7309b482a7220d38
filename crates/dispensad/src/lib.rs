//! dispensad service wiring
//!
//! Connects the pieces:
//! - Case catalog (configuration)
//! - Store (sessions, recovery ledger, audit log)
//! - Session engine and its deadline scheduler
//! - IPC server and event fan-out

use anyhow::{anyhow, Context, Result};
use dispensa_api::{
    CaseView, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Response,
    ResponsePayload,
};
use dispensa_config::Catalog;
use dispensa_core::{CoreEvent, SessionError, SessionService};
use dispensa_ipc::{IpcServer, ServerMessage};
use dispensa_store::{AuditEvent, AuditEventType, Store};
use dispensa_util::{ClientId, Clock, RateLimiter, SessionId};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Requests allowed per client per second
const REQUESTS_PER_SECOND: u32 = 30;

/// Main service state
pub struct Service {
    catalog: Catalog,
    sessions: SessionService,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    core_events: mpsc::UnboundedReceiver<CoreEvent>,
    rate_limiter: RateLimiter<ClientId>,
}

impl Service {
    /// Restore persisted state and bind the socket
    pub async fn new(
        catalog: Catalog,
        socket_path: &Path,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;
        store.append_audit(AuditEvent::new(AuditEventType::CatalogLoaded {
            case_count: catalog.cases.len(),
        }))?;

        let (event_tx, core_events) = mpsc::unbounded_channel();
        let sessions = SessionService::new(&catalog.service, store.clone(), clock, Arc::new(event_tx));

        let restored = sessions
            .restore()
            .context("Failed to restore sessions")?;
        info!(restored, "Session state loaded");

        let mut ipc = IpcServer::new(socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            catalog,
            sessions,
            ipc: Arc::new(ipc),
            store,
            core_events,
            rate_limiter: RateLimiter::new(REQUESTS_PER_SECOND, Duration::from_secs(1)),
        })
    }

    /// Serve until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let scheduler = self.sessions.spawn_scheduler();

        let mut ipc_messages = self
            .ipc
            .take_message_receiver()
            .await
            .ok_or_else(|| anyhow!("IPC message receiver already taken"))?;

        let ipc_accept = self.ipc.clone();
        let accept = tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        tokio::pin!(shutdown);

        info!("Service running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(msg) = ipc_messages.recv() => {
                    self.handle_ipc_message(msg).await;
                }

                Some(event) = self.core_events.recv() => {
                    self.ipc.broadcast_event(Event::new(event_payload(event)));
                }
            }
        }

        info!("Shutting down dispensad");

        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        scheduler.abort();
        accept.abort();

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let response = if self.rate_limiter.check(&client_id) {
                    self.handle_command(&client_id, request.request_id, request.command)
                } else {
                    Response::error(
                        request.request_id,
                        ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"),
                    )
                };

                if let Err(e) = self.ipc.send_response(&client_id, response).await {
                    debug!(client_id = %client_id, error = %e, "Failed to send response");
                }
            }

            ServerMessage::ClientConnected { client_id, uid } => {
                info!(client_id = %client_id, uid = ?uid, "Client connected");

                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self
                    .store
                    .append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    }));

                self.rate_limiter.remove(&client_id);
            }
        }
    }

    fn status_response(&self, request_id: u64, session_id: &SessionId) -> Response {
        match self.sessions.get_status(session_id) {
            Ok(view) => Response::success(request_id, ResponsePayload::Status(view)),
            Err(e) => session_error(request_id, e),
        }
    }

    fn handle_command(&self, client_id: &ClientId, request_id: u64, command: Command) -> Response {
        match command {
            Command::CreateSession {
                owner_id,
                subject_id,
                case_id,
            } => {
                let Some(case) = self.catalog.get_case(&case_id) else {
                    return Response::error(
                        request_id,
                        ErrorInfo::new(ErrorCode::UnknownCase, format!("Unknown case {}", case_id)),
                    );
                };

                match self
                    .sessions
                    .create_session_for_case(owner_id, subject_id, case)
                {
                    Ok(session_id) => {
                        Response::success(request_id, ResponsePayload::SessionCreated { session_id })
                    }
                    Err(e) => session_error(request_id, e),
                }
            }

            Command::Start { session_id } => match self.sessions.start(&session_id) {
                Ok(()) => self.status_response(request_id, &session_id),
                Err(e) => session_error(request_id, e),
            },

            Command::CompleteTask {
                session_id,
                task_id,
            } => match self.sessions.complete_task(&session_id, &task_id) {
                Ok(_) => self.status_response(request_id, &session_id),
                Err(e) => session_error(request_id, e),
            },

            Command::Counsel {
                session_id,
                instructions,
            } => match self.sessions.counsel(&session_id, instructions.as_slice()) {
                Ok(_) => self.status_response(request_id, &session_id),
                Err(e) => session_error(request_id, e),
            },

            Command::Recover { session_id } => match self.sessions.recover(&session_id) {
                Ok(_) => self.status_response(request_id, &session_id),
                Err(e) => session_error(request_id, e),
            },

            Command::GetStatus { session_id } => self.status_response(request_id, &session_id),

            Command::GetRecoveryBudget { owner_id } => Response::success(
                request_id,
                ResponsePayload::RecoveryBudget(self.sessions.recovery_budget(&owner_id)),
            ),

            Command::ListCases => {
                let cases = self
                    .catalog
                    .cases
                    .iter()
                    .map(|case| CaseView {
                        case_id: case.id.clone(),
                        label: case.label.clone(),
                        duration_budget: case.duration_budget,
                        required_tasks: case.required_tasks(),
                    })
                    .collect();
                Response::success(request_id, ResponsePayload::Cases(cases))
            }

            Command::SubscribeEvents => Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),

            Command::UnsubscribeEvents => {
                Response::success(request_id, ResponsePayload::Unsubscribed)
            }

            Command::GetHealth => {
                let store_ok = self.sessions.is_store_healthy();
                Response::success(
                    request_id,
                    ResponsePayload::Health(HealthStatus {
                        live: true,
                        ready: store_ok,
                        catalog_loaded: !self.catalog.cases.is_empty(),
                        store_ok,
                        pending_deadlines: self.sessions.pending_deadlines(),
                    }),
                )
            }

            Command::Ping => Response::success(request_id, ResponsePayload::Pong),
        }
    }
}

/// Protocol error for a rejected session operation
pub fn session_error(request_id: u64, error: SessionError) -> Response {
    let code = match &error {
        SessionError::AlreadyStarted => ErrorCode::AlreadyStarted,
        SessionError::SessionNotActive => ErrorCode::SessionNotActive,
        SessionError::NotLost => ErrorCode::NotLost,
        SessionError::RecoveryDenied { .. } => ErrorCode::RecoveryDenied,
        SessionError::UnknownSession => ErrorCode::UnknownSession,
        SessionError::UnknownTask => ErrorCode::UnknownTask,
        SessionError::InvalidCounselling => ErrorCode::InvalidCounselling,
        SessionError::InvalidBudget | SessionError::InvalidTaskGraph(_) => {
            ErrorCode::InvalidRequest
        }
    };

    Response::error(request_id, ErrorInfo::new(code, error.to_string()))
}

/// Wire form of a core event
pub fn event_payload(event: CoreEvent) -> EventPayload {
    match event {
        CoreEvent::SessionStarted {
            session_id,
            owner_id,
            deadline,
        } => EventPayload::SessionStarted {
            session_id,
            owner_id,
            deadline,
        },
        CoreEvent::TaskCompleted {
            session_id,
            task_id,
        } => EventPayload::TaskCompleted {
            session_id,
            task_id,
        },
        CoreEvent::SessionRecovered {
            session_id,
            owner_id,
            elapsed,
        } => EventPayload::SessionRecovered {
            session_id,
            owner_id,
            elapsed,
        },
        CoreEvent::SessionLost {
            session_id,
            owner_id,
        } => EventPayload::SessionLost {
            session_id,
            owner_id,
        },
        CoreEvent::SessionResumed {
            session_id,
            owner_id,
            deadline,
            tokens_remaining,
        } => EventPayload::SessionResumed {
            session_id,
            owner_id,
            deadline,
            tokens_remaining,
        },
    }
}
