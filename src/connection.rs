//! Connection login state machine
//!
//! A connection moves `Idle -> WaitConnect -> WaitPduResponse -> ... -> Idle`
//! while it logs in. Each step is triggered by an event from the owning
//! session's [`Mainloop`]; a finished step reports a [`CnxLoginStatus`] that
//! the session turns into a retry, a redirect or a final outcome.

use crate::error::{IscsiError, IscsiResult};
use crate::login::{self, LoginContext, LoginProgress, LoginStatus, LOGIN_BUFFER_SIZE};
use crate::mainloop::{EventKind, Mainloop, TimerId, TimerKind};
use crate::params::{DigestPreference, DigestType, DEFAULT_SEGMENT_LENGTH};
use crate::pdu::{login_status, LoginStage};
use crate::session::{Session, SessionId};
use crate::transport::{parse_target_address, Portal, Readiness, Transport};
use std::fmt;
use std::time::{Duration, Instant};

/// Per-connection time budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for each Login Response
    pub login: Duration,
    /// Wait for each Login Response while in the Security stage
    pub auth: Duration,
    /// Transport connect
    pub active: Duration,
    pub idle: Duration,
    pub ping: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            login: Duration::from_secs(15),
            auth: Duration::from_secs(45),
            active: Duration::from_secs(5),
            idle: Duration::from_secs(60),
            ping: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Idle,
    /// Transport connect in progress
    WaitConnect,
    /// Login Request sent, waiting for the response
    WaitPduResponse,
}

/// Result of one login attempt as seen by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnxLoginStatus {
    Success,
    /// Do not retry
    Failed,
    IoErr,
    /// Retry after DefaultTime2Wait
    Retry,
    /// Retry at once, the peer dropped the connection
    ImmRetry,
    /// Retry at once against the address the target redirected us to
    ImmRedirectRetry,
}

impl CnxLoginStatus {
    /// Classify a finished login
    pub fn from_login(status: LoginStatus, status_class: u8) -> Self {
        match status {
            LoginStatus::Ok => CnxLoginStatus::Success,
            LoginStatus::IoError => CnxLoginStatus::IoErr,
            LoginStatus::Failed if status_class == login_status::TARGET_ERROR => CnxLoginStatus::Retry,
            _ => CnxLoginStatus::Failed,
        }
    }

    /// Classify a transport failure
    pub fn from_error(err: &IscsiError) -> Self {
        if err.is_peer_closed() {
            CnxLoginStatus::ImmRetry
        } else if err.is_timeout() {
            CnxLoginStatus::Retry
        } else if matches!(err, IscsiError::Io(_)) {
            CnxLoginStatus::IoErr
        } else {
            CnxLoginStatus::Failed
        }
    }
}

/// Final report of a connection login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub cid: u16,
    pub status: CnxLoginStatus,
    pub login_status: LoginStatus,
    pub status_class: u8,
    pub status_detail: u8,
}

/// One TCP (or offloaded) connection of a session
pub struct Connection {
    pub cid: u16,
    /// Owning session
    pub session: SessionId,
    pub login_context: Option<LoginContext>,
    /// Receive buffer, lent to the login context while a login runs
    pub rx_buffer: Vec<u8>,
    pub state: ConnState,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    /// The last Login Response had C set and more text is owed
    pub partial_response: bool,
    pub status: Option<CnxLoginStatus>,
    pub portal: Portal,
    pub transport: Box<dyn Transport>,
    pub tcp_window_size: Option<usize>,
    pub type_of_service: Option<u32>,
    pub timeouts: Timeouts,
    pub exp_statsn: u32,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
    pub header_digest_pref: DigestPreference,
    pub data_digest_pref: DigestPreference,
    /// What we declare as MaxRecvDataSegmentLength
    pub max_recv_data_segment_len: u32,
    /// What the target declared
    pub max_xmit_data_segment_len: u32,
    pub login_status: LoginStatus,
    pub status_class: u8,
    pub status_detail: u8,
    pub retries: u32,
    pub redirects: u32,
    timer: Option<TimerId>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("cid", &self.cid)
            .field("session", &self.session)
            .field("state", &self.state)
            .field("current_stage", &self.current_stage)
            .field("next_stage", &self.next_stage)
            .field("portal", &self.portal)
            .field("status", &self.status)
            .field("login_status", &self.login_status)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(cid: u16, session: SessionId, portal: Portal, transport: Box<dyn Transport>) -> Self {
        Connection {
            cid,
            session,
            login_context: None,
            rx_buffer: Vec::with_capacity(LOGIN_BUFFER_SIZE),
            state: ConnState::Idle,
            current_stage: LoginStage::Initial,
            next_stage: LoginStage::Initial,
            partial_response: false,
            status: None,
            portal,
            transport,
            tcp_window_size: None,
            type_of_service: None,
            timeouts: Timeouts::default(),
            exp_statsn: 0,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            header_digest_pref: DigestPreference::None,
            data_digest_pref: DigestPreference::None,
            max_recv_data_segment_len: DEFAULT_SEGMENT_LENGTH,
            max_xmit_data_segment_len: DEFAULT_SEGMENT_LENGTH,
            login_status: LoginStatus::Ok,
            status_class: 0,
            status_detail: 0,
            retries: 0,
            redirects: 0,
            timer: None,
        }
    }

    /// Point the connection at a `TargetAddress` value. Returns its portal group tag.
    pub fn update_address(&mut self, address: &str) -> IscsiResult<Option<u16>> {
        let (portal, tag) = parse_target_address(address)?;
        log::debug!("cid {}: address {} -> {}", self.cid, self.portal, portal);
        self.portal = portal;
        Ok(tag)
    }

    /// Refuse a data segment longer than the target accepts
    pub fn check_xmit_len(&self, len: usize) -> IscsiResult<()> {
        let limit = self.max_xmit_data_segment_len as usize;
        if len > limit {
            return Err(IscsiError::BufferOverflow {
                needed: len,
                available: limit,
            });
        }
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.status == Some(CnxLoginStatus::Success)
            && self.current_stage == LoginStage::FullFeature
            && self.transport.is_connected()
    }

    /// Budget for the Login Response to the request just sent
    pub fn round_timeout(&self) -> Duration {
        if self.current_stage == LoginStage::Security {
            self.timeouts.auth
        } else {
            self.timeouts.login
        }
    }

    pub(crate) fn outcome(&self) -> LoginOutcome {
        LoginOutcome {
            cid: self.cid,
            status: self.status.unwrap_or(CnxLoginStatus::Failed),
            login_status: self.login_status,
            status_class: self.status_class,
            status_detail: self.status_detail,
        }
    }

    /// Start a non-blocking connect to the current portal
    ///
    /// A reconnect after a redirect uses the login timeout instead of the
    /// active timeout for the connect.
    pub fn connect(&mut self, mainloop: &mut Mainloop, now: Instant, redirected: bool) -> Option<CnxLoginStatus> {
        self.disconnect(mainloop);
        self.status = None;
        self.login_status = LoginStatus::Ok;
        self.status_class = 0;
        self.status_detail = 0;

        log::info!("cid {}: connecting to {}", self.cid, self.portal);
        if let Err(e) = self.transport.connect(&self.portal, true) {
            log::warn!("cid {}: connect to {} failed: {}", self.cid, self.portal, e);
            self.login_status = LoginStatus::IoError;
            return Some(self.fail(mainloop, CnxLoginStatus::from_error(&e)));
        }

        self.state = ConnState::WaitConnect;
        let budget = if redirected {
            self.timeouts.login
        } else {
            self.timeouts.active
        };
        self.arm(mainloop, TimerKind::Connect, budget, now);
        None
    }

    /// Handle one event from the session's mainloop
    pub fn handle_event(&mut self, session: &mut Session, kind: EventKind, now: Instant) -> Option<CnxLoginStatus> {
        match (self.state, kind) {
            (ConnState::WaitConnect, EventKind::Poll) => self.on_poll(session, now),
            (ConnState::WaitPduResponse, EventKind::RecvPdu) => self.on_pdu(session, now),
            (ConnState::WaitConnect, EventKind::Timer(TimerKind::Connect))
            | (ConnState::WaitPduResponse, EventKind::Timer(TimerKind::Login)) => {
                log::warn!("cid {}: timed out in {:?}", self.cid, self.state);
                self.timer = None;
                self.login_status = LoginStatus::IoError;
                Some(self.fail(&mut session.mainloop, CnxLoginStatus::Retry))
            }
            (ConnState::Idle, EventKind::Timer(TimerKind::Reconnect)) => {
                self.connect(&mut session.mainloop, now, false)
            }
            (state, kind) => {
                log::debug!("cid {}: ignoring {:?} in {:?}", self.cid, kind, state);
                None
            }
        }
    }

    fn on_poll(&mut self, session: &mut Session, now: Instant) -> Option<CnxLoginStatus> {
        match self.transport.poll() {
            Ok(Readiness::Pending) => None,
            Ok(_) => {
                log::info!("cid {}: connected to {}", self.cid, self.portal);
                self.disarm(&mut session.mainloop);
                if let Err(e) = login::login_begin(session, self) {
                    log::warn!("cid {}: cannot start login: {}", self.cid, e);
                    self.login_status = LoginStatus::Failed;
                    return Some(self.fail(&mut session.mainloop, CnxLoginStatus::Failed));
                }
                self.send_login_request(session, now)
            }
            Err(e) => {
                log::warn!("cid {}: connect to {} failed: {}", self.cid, self.portal, e);
                self.login_status = LoginStatus::IoError;
                Some(self.fail(&mut session.mainloop, CnxLoginStatus::from_error(&e)))
            }
        }
    }

    fn send_login_request(&mut self, session: &mut Session, now: Instant) -> Option<CnxLoginStatus> {
        let request = match login::login_req(session, self)
            .and_then(|pdu| self.check_xmit_len(pdu.data.len()).map(|_| pdu))
        {
            Ok(pdu) => pdu,
            Err(e) => {
                log::warn!("cid {}: cannot build Login Request: {}", self.cid, e);
                self.login_status = LoginStatus::Failed;
                return Some(self.fail(&mut session.mainloop, CnxLoginStatus::Failed));
            }
        };

        let timeout = self.round_timeout();
        if let Err(e) = self.transport.send_pdu(&request, false, false, timeout) {
            log::warn!("cid {}: sending Login Request failed: {}", self.cid, e);
            self.login_status = LoginStatus::IoError;
            return Some(self.fail(&mut session.mainloop, CnxLoginStatus::from_error(&e)));
        }

        self.state = ConnState::WaitPduResponse;
        self.arm(&mut session.mainloop, TimerKind::Login, timeout, now);
        None
    }

    /// Posted once `poll` holds a whole PDU, or after the transport failed,
    /// so the receive below returns without waiting
    fn on_pdu(&mut self, session: &mut Session, now: Instant) -> Option<CnxLoginStatus> {
        let timeout = self.round_timeout();
        let pdu = match self.transport.recv_pdu(
            false,
            false,
            self.max_recv_data_segment_len as usize,
            timeout,
        ) {
            Ok(pdu) => pdu,
            Err(IscsiError::InvalidPdu(msg)) => {
                log::warn!("cid {}: malformed Login Response: {}", self.cid, msg);
                self.login_status = LoginStatus::InvalidPdu;
                return Some(self.fail(&mut session.mainloop, CnxLoginStatus::Failed));
            }
            Err(e) => {
                log::warn!("cid {}: receiving Login Response failed: {}", self.cid, e);
                self.login_status = LoginStatus::IoError;
                return Some(self.fail(&mut session.mainloop, CnxLoginStatus::from_error(&e)));
            }
        };
        self.disarm(&mut session.mainloop);

        match login::login_rsp(session, self, &pdu) {
            LoginProgress::Continue => self.send_login_request(session, now),
            LoginProgress::Redirected => Some(self.fail(&mut session.mainloop, CnxLoginStatus::ImmRedirectRetry)),
            LoginProgress::Finished(LoginStatus::Ok) => {
                self.record_context();
                self.release_login_context();
                self.login_status = LoginStatus::Ok;
                self.state = ConnState::Idle;
                self.status = Some(CnxLoginStatus::Success);
                Some(CnxLoginStatus::Success)
            }
            LoginProgress::Finished(status) => {
                self.login_status = status;
                self.record_context();
                let cnx_status = CnxLoginStatus::from_login(status, self.status_class);
                Some(self.fail(&mut session.mainloop, cnx_status))
            }
        }
    }

    fn arm(&mut self, mainloop: &mut Mainloop, kind: TimerKind, after: Duration, now: Instant) {
        self.disarm(mainloop);
        self.timer = Some(mainloop.schedule(self.cid, kind, after, now));
    }

    fn disarm(&mut self, mainloop: &mut Mainloop) {
        if let Some(id) = self.timer.take() {
            mainloop.cancel(id);
        }
    }

    /// Keep the status class/detail of the last Login Response
    fn record_context(&mut self) {
        if let Some(ctx) = &self.login_context {
            self.status_class = ctx.status_class;
            self.status_detail = ctx.status_detail;
        }
    }

    /// Drop the login context and take the receive buffer back
    pub fn release_login_context(&mut self) {
        if let Some(mut ctx) = self.login_context.take() {
            ctx.buffer.clear();
            self.rx_buffer = std::mem::take(&mut ctx.buffer);
        }
    }

    /// Record the outcome of a blocking login
    pub(crate) fn record_login(&mut self, status: LoginStatus) {
        self.record_context();
        let cnx_status = CnxLoginStatus::from_login(status, self.status_class);
        self.record_outcome(status, cnx_status);
    }

    /// A blocking login ran out of redirects; reported the way the event
    /// loop reports it
    pub(crate) fn record_redirect_limit(&mut self) {
        self.record_context();
        self.record_outcome(LoginStatus::RedirectionFailed, CnxLoginStatus::ImmRedirectRetry);
    }

    fn record_outcome(&mut self, status: LoginStatus, cnx_status: CnxLoginStatus) {
        self.login_status = status;
        self.release_login_context();
        self.status = Some(cnx_status);
        if cnx_status != CnxLoginStatus::Success {
            self.transport.disconnect();
            self.current_stage = LoginStage::Initial;
            self.next_stage = LoginStage::Initial;
            self.partial_response = false;
        }
    }

    fn fail(&mut self, mainloop: &mut Mainloop, status: CnxLoginStatus) -> CnxLoginStatus {
        self.record_context();
        self.disconnect(mainloop);
        self.status = Some(status);
        status
    }

    /// Release the transport and every pending timer; the login starts over
    /// from the initial stage next time
    pub fn disconnect(&mut self, mainloop: &mut Mainloop) {
        self.transport.disconnect();
        mainloop.cancel_cnx(self.cid);
        self.timer = None;
        self.release_login_context();
        self.state = ConnState::Idle;
        self.current_stage = LoginStage::Initial;
        self.next_stage = LoginStage::Initial;
        self.partial_response = false;
    }
}
