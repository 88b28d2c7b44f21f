//! Daemon core
//!
//! [`Initiator`] owns the provider table and every session. It consumes
//! [`QueueTask`]s from the control plane, drives each session's mainloop and
//! answers every login request exactly once.

use crate::config::NodeRecord;
use crate::connection::{CnxLoginStatus, LoginOutcome};
use crate::error::IscsiResult;
use crate::ipc::{AsyncEventKind, IpcFd, IpcReply, IpcResponse, QueueTask};
use crate::provider::ProviderTable;
use crate::session::{Session, SessionId};
use crate::transport::{Portal, TcpTransport, Transport};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Connection id used for the first connection of every session
const LEADING_CID: u16 = 0;

/// Creates the transport for a new connection
pub type TransportFactory = Box<dyn FnMut(&Portal) -> Box<dyn Transport>>;

/// iSCSI initiator daemon core
pub struct Initiator {
    providers: ProviderTable,
    sessions: BTreeMap<SessionId, Session>,
    /// Login replies still owed, by session
    pending: HashMap<SessionId, IpcFd>,
    outbox: Vec<IpcReply>,
    next_session: u32,
    transports: TransportFactory,
    logout_timeout: Duration,
}

impl fmt::Debug for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initiator")
            .field("providers", &self.providers)
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("pending", &self.pending)
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl Initiator {
    /// Create a new initiator builder
    pub fn builder() -> InitiatorBuilder {
        InitiatorBuilder::new()
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    pub fn providers_mut(&mut self) -> &mut ProviderTable {
        &mut self.providers
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Earliest timer across every session
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.mainloop.next_deadline())
            .min()
    }

    /// Replies produced since the last call
    pub fn take_responses(&mut self) -> Vec<IpcReply> {
        std::mem::take(&mut self.outbox)
    }

    fn reply(&mut self, ipc_fd: IpcFd, response: IpcResponse) {
        log::debug!("ipc fd {}: {:?}", ipc_fd, response);
        self.outbox.push(IpcReply { ipc_fd, response });
    }

    /// Handle one control-plane task
    pub fn submit(&mut self, task: QueueTask, now: Instant) {
        match task {
            QueueTask::Login { rec, ipc_fd } => {
                if let Err(e) = self.start_login(rec, ipc_fd, now) {
                    log::warn!("login request on fd {} refused: {}", ipc_fd, e);
                    self.reply(ipc_fd, IpcResponse::Error { message: e.to_string() });
                }
            }
            QueueTask::Logout { session, ipc_fd } => self.logout(session, ipc_fd),
            QueueTask::AsyncEvent { session, event } => self.async_event(session, event),
        }
    }

    fn start_login(&mut self, rec: NodeRecord, ipc_fd: IpcFd, now: Instant) -> IscsiResult<()> {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let transport = (self.transports)(&rec.portal);

        let mut session = Session::create(id, rec, &mut self.providers)?;
        if let Err(e) = session.cnx_create(LEADING_CID, transport) {
            session.destroy(&mut self.providers);
            return Err(e);
        }

        let outcome = match session.connect(LEADING_CID, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                session.destroy(&mut self.providers);
                return Err(e);
            }
        };
        self.sessions.insert(id, session);
        self.pending.insert(id, ipc_fd);

        if let Some(outcome) = outcome {
            self.report(id, &outcome);
        }
        self.reap();
        Ok(())
    }

    fn logout(&mut self, id: SessionId, ipc_fd: IpcFd) {
        let Some(session) = self.sessions.get_mut(&id) else {
            self.reply(
                ipc_fd,
                IpcResponse::Error {
                    message: format!("no session {}", id.0),
                },
            );
            return;
        };

        let response = match session.logout(self.logout_timeout) {
            Ok(()) => IpcResponse::LoggedOut { session: id },
            Err(e) => {
                log::warn!("session {}: logout failed: {}", id.0, e);
                IpcResponse::Error { message: e.to_string() }
            }
        };
        self.reply(ipc_fd, response);
        self.reap();
    }

    fn async_event(&mut self, id: SessionId, event: AsyncEventKind) {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::debug!("async event {:?} for unknown session {}", event, id.0);
            return;
        };
        log::info!("session {}: async event {:?}", id.0, event);
        match event {
            AsyncEventKind::DropConnection { cid } => session.cnx_destroy(cid),
            AsyncEventKind::DropSession => {
                let cids: Vec<u16> = session.connections().map(|c| c.cid).collect();
                for cid in cids {
                    session.cnx_destroy(cid);
                }
            }
        }
        self.reap();
    }

    /// Run every session's event loop once
    pub fn run_once(&mut self, now: Instant) {
        let mut finished: Vec<(SessionId, LoginOutcome)> = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            finished.extend(session.process_events(now).into_iter().map(|o| (*id, o)));
        }
        for (id, outcome) in finished {
            self.report(id, &outcome);
        }
        self.reap();
    }

    /// Answer the login request waiting on a session, if any
    fn report(&mut self, id: SessionId, outcome: &LoginOutcome) {
        let Some(ipc_fd) = self.pending.remove(&id) else {
            return;
        };
        let response = match outcome.status {
            CnxLoginStatus::Success => IpcResponse::LoggedIn {
                session: id,
                tsih: self.sessions.get(&id).map(|s| s.tsih).unwrap_or(0),
            },
            _ => IpcResponse::LoginFailed {
                session: id,
                status: outcome.login_status,
                status_class: outcome.status_class,
                status_detail: outcome.status_detail,
            },
        };
        self.reply(ipc_fd, response);
    }

    /// Destroy sessions without connections
    fn reap(&mut self) {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_dead())
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            if let Some(session) = self.sessions.remove(&id) {
                session.destroy(&mut self.providers);
            }
            if let Some(ipc_fd) = self.pending.remove(&id) {
                self.reply(
                    ipc_fd,
                    IpcResponse::Error {
                        message: format!("session {} closed before login finished", id.0),
                    },
                );
            }
        }
    }
}

fn tcp_transport(_portal: &Portal) -> Box<dyn Transport> {
    Box::new(TcpTransport::new())
}

/// Builder for [`Initiator`]
pub struct InitiatorBuilder {
    providers: ProviderTable,
    transports: Option<TransportFactory>,
    logout_timeout: Duration,
}

impl InitiatorBuilder {
    fn new() -> Self {
        Self {
            providers: ProviderTable::init(),
            transports: None,
            logout_timeout: Duration::from_secs(15),
        }
    }

    pub fn providers(mut self, providers: ProviderTable) -> Self {
        self.providers = providers;
        self
    }

    /// Transports for new connections; software TCP if unset
    pub fn transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transports = Some(factory);
        self
    }

    pub fn logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    pub fn build(self) -> Initiator {
        let transports: TransportFactory = match self.transports {
            Some(factory) => factory,
            None => Box::new(tcp_transport),
        };
        Initiator {
            providers: self.providers,
            sessions: BTreeMap::new(),
            pending: HashMap::new(),
            outbox: Vec::new(),
            next_session: 0,
            transports,
            logout_timeout: self.logout_timeout,
        }
    }
}
