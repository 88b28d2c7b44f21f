//! iSCSI session management
//!
//! A session owns its connections (slot index == CID), the shared command
//! sequence space and the session-wide parameters fixed by the leading
//! login, based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! All connections are driven from the session's [`Mainloop`] by
//! [`Session::process_events`]; nothing here blocks except [`Session::logout`].

use crate::auth::AuthConfig;
use crate::config::NodeRecord;
use crate::connection::{CnxLoginStatus, ConnState, Connection, LoginOutcome};
use crate::error::{IscsiError, IscsiResult};
use crate::login::{self, LoginStatus};
use crate::mainloop::{Event, EventKind, Mainloop, TimerKind};
use crate::params::{self, parse_bool, parse_number, yes_no, IrrelevantKeys};
use crate::pdu::{logout_reason, logout_response, IscsiPdu};
use crate::provider::{ProviderTable, ProviderType};
use crate::transport::{Readiness, Transport};
use std::time::{Duration, Instant};

/// Connection slots per session
pub const ISCSI_CNX_MAX: usize = 8;

/// ITT value reserved by RFC 3720
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// Handle of a session inside the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Normal => "Normal",
            SessionType::Discovery => "Discovery",
        }
    }
}

/// Session-wide operational parameters (RFC 3720 Section 12)
///
/// Used both for the values a node offers and for the values a session ends
/// up with after the leading login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub max_connections: u16,
    /// Initial R2T required
    pub initial_r2t: bool,
    /// Immediate data allowed
    pub immediate_data: bool,
    /// First burst length for unsolicited data (default: 65536)
    pub first_burst_length: u32,
    /// Maximum burst length (default: 262144)
    pub max_burst_length: u32,
    /// Time to wait before reconnecting (seconds)
    pub default_time2wait: u16,
    /// Time a connection's tasks may be reassigned after it drops (seconds)
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u16,
    /// Data PDU in order (within a sequence)
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    /// Error recovery level (0-2)
    pub error_recovery_level: u8,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_connections: 1,
            initial_r2t: true,
            immediate_data: true,
            first_burst_length: 65536,
            max_burst_length: 262144,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
        }
    }
}

impl SessionParams {
    /// Text value of a session key, `None` for keys this struct does not hold
    pub fn value(&self, key: &str) -> Option<String> {
        let v = match key {
            params::MAX_CONNECTIONS => self.max_connections.to_string(),
            params::INITIAL_R2T => yes_no(self.initial_r2t).to_string(),
            params::IMMEDIATE_DATA => yes_no(self.immediate_data).to_string(),
            params::FIRST_BURST_LENGTH => self.first_burst_length.to_string(),
            params::MAX_BURST_LENGTH => self.max_burst_length.to_string(),
            params::DEFAULT_TIME2WAIT => self.default_time2wait.to_string(),
            params::DEFAULT_TIME2RETAIN => self.default_time2retain.to_string(),
            params::MAX_OUTSTANDING_R2T => self.max_outstanding_r2t.to_string(),
            params::DATA_PDU_IN_ORDER => yes_no(self.data_pdu_in_order).to_string(),
            params::DATA_SEQUENCE_IN_ORDER => yes_no(self.data_sequence_in_order).to_string(),
            params::ERROR_RECOVERY_LEVEL => self.error_recovery_level.to_string(),
            _ => return None,
        };
        Some(v)
    }

    /// Store a negotiated value
    pub fn apply(&mut self, key: &str, value: &str) -> IscsiResult<()> {
        let bad = || IscsiError::Negotiation(format!("cannot apply {}={}", key, value));
        let num = || parse_number(value).ok_or_else(bad);
        let flag = || parse_bool(value).ok_or_else(bad);

        match key {
            params::MAX_CONNECTIONS => {
                self.max_connections = u16::try_from(num()?).map_err(|_| bad())?
            }
            params::INITIAL_R2T => self.initial_r2t = flag()?,
            params::IMMEDIATE_DATA => self.immediate_data = flag()?,
            params::FIRST_BURST_LENGTH => self.first_burst_length = num()?,
            params::MAX_BURST_LENGTH => self.max_burst_length = num()?,
            params::DEFAULT_TIME2WAIT => {
                self.default_time2wait = u16::try_from(num()?).map_err(|_| bad())?
            }
            params::DEFAULT_TIME2RETAIN => {
                self.default_time2retain = u16::try_from(num()?).map_err(|_| bad())?
            }
            params::MAX_OUTSTANDING_R2T => {
                self.max_outstanding_r2t = u16::try_from(num()?).map_err(|_| bad())?
            }
            params::DATA_PDU_IN_ORDER => self.data_pdu_in_order = flag()?,
            params::DATA_SEQUENCE_IN_ORDER => self.data_sequence_in_order = flag()?,
            params::ERROR_RECOVERY_LEVEL => {
                self.error_recovery_level = u8::try_from(num()?).map_err(|_| bad())?
            }
            _ => {
                log::debug!("Ignoring non-session parameter: {}={}", key, value);
            }
        }
        Ok(())
    }
}

/// `a < b` in 32-bit serial number arithmetic (RFC 1982)
pub fn sn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a > b` in 32-bit serial number arithmetic (RFC 1982)
pub fn sn_gt(a: u32, b: u32) -> bool {
    sn_lt(b, a)
}

/// Command numbering shared by every connection of a session
///
/// Holds ExpCmdSN <= CmdSN <= MaxCmdSN + 1 at all times. Once the leading
/// login has seeded it, none of the three ever moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSequence {
    pub itt: u32,
    /// Next CmdSN to assign
    pub cmdsn: u32,
    pub exp_cmdsn: u32,
    pub max_cmdsn: u32,
}

impl Default for CmdSequence {
    fn default() -> Self {
        CmdSequence {
            itt: 0,
            cmdsn: 1,
            exp_cmdsn: 1,
            max_cmdsn: 1,
        }
    }
}

impl CmdSequence {
    /// Allocate an Initiator Task Tag, skipping the reserved value
    pub fn next_itt(&mut self) -> u32 {
        let itt = self.itt;
        self.itt = self.itt.wrapping_add(1);
        if self.itt == RESERVED_TAG {
            self.itt = 0;
        }
        itt
    }

    /// Take ExpCmdSN/MaxCmdSN from the first response of a leading login
    ///
    /// Nothing has been numbered yet, so the target's window replaces ours
    /// outright, a closed one included. Returns false, leaving the sequence
    /// alone, when MaxCmdSN < ExpCmdSN - 1.
    pub fn seed(&mut self, exp_cmdsn: u32, max_cmdsn: u32) -> bool {
        if sn_lt(max_cmdsn, exp_cmdsn.wrapping_sub(1)) {
            return false;
        }
        self.cmdsn = exp_cmdsn;
        self.exp_cmdsn = exp_cmdsn;
        self.max_cmdsn = max_cmdsn;
        true
    }

    /// Apply ExpCmdSN/MaxCmdSN from a response.
    ///
    /// Returns false when the update is ignored because MaxCmdSN < ExpCmdSN - 1
    /// (RFC 3720 Section 3.2.2.1).
    pub fn update(&mut self, exp_cmdsn: u32, max_cmdsn: u32) -> bool {
        if sn_lt(max_cmdsn, exp_cmdsn.wrapping_sub(1)) {
            return false;
        }
        if sn_gt(exp_cmdsn, self.exp_cmdsn) {
            self.exp_cmdsn = exp_cmdsn;
        }
        if sn_gt(max_cmdsn, self.max_cmdsn) {
            self.max_cmdsn = max_cmdsn;
        }
        if sn_lt(self.cmdsn, self.exp_cmdsn) {
            self.cmdsn = self.exp_cmdsn;
        }
        true
    }

    /// The target will accept another non-immediate command
    pub fn window_open(&self) -> bool {
        !sn_gt(self.cmdsn, self.max_cmdsn)
    }

    /// Allocate a CmdSN for a non-immediate command
    pub fn next_cmdsn(&mut self) -> IscsiResult<u32> {
        if !self.window_open() {
            return Err(IscsiError::Session(format!(
                "CmdSN window closed: CmdSN {} MaxCmdSN {}",
                self.cmdsn, self.max_cmdsn
            )));
        }
        let sn = self.cmdsn;
        self.cmdsn = self.cmdsn.wrapping_add(1);
        Ok(sn)
    }
}

/// How hard a session tries before giving up on a connection login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after timeouts, drops and transient target errors
    pub login_retries: u32,
    /// Redirects followed per login
    pub max_redirects: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            login_retries: 3,
            max_redirects: 8,
        }
    }
}

/// iSCSI Session
///
/// Owns its connections; each connection only refers back to the session by
/// [`SessionId`].
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Copy of the node record the session was created from
    pub rec: NodeRecord,
    pub initiator_name: String,
    pub initiator_alias: Option<String>,
    pub target_name: String,
    pub target_alias: Option<String>,
    /// Initiator Session ID (6 bytes)
    pub isid: [u8; 6],
    /// Target Session Identifying Handle, 0 until the leading login completes
    pub tsih: u16,
    pub portal_group_tag: Option<u16>,
    pub session_type: SessionType,
    /// Values in effect after the leading login
    pub params: SessionParams,
    pub seq: CmdSequence,
    pub irrelevant: IrrelevantKeys,
    pub auth: AuthConfig,
    pub provider: ProviderType,
    /// Data path is offloaded; fixed at creation
    pub kernel_io: bool,
    pub retry: RetryPolicy,
    pub mainloop: Mainloop,
    /// Connection running the leading login while the TSIH is still 0
    leading_cid: Option<u16>,
    cnx: Vec<Option<Connection>>,
}

impl Session {
    /// Create a session from a node record and bind it to its provider
    pub fn create(id: SessionId, rec: NodeRecord, providers: &mut ProviderTable) -> IscsiResult<Self> {
        providers.bind(rec.provider, id)?;

        log::info!(
            "session {}: created for {} via {} ({})",
            id.0,
            if rec.target_name.is_empty() { "discovery" } else { rec.target_name.as_str() },
            rec.portal,
            rec.provider.name()
        );

        Ok(Session {
            id,
            initiator_name: rec.initiator_name.clone(),
            initiator_alias: rec.initiator_alias.clone(),
            target_name: rec.target_name.clone(),
            target_alias: None,
            isid: rec.isid,
            tsih: 0,
            portal_group_tag: rec.portal_group_tag,
            session_type: rec.session_type,
            params: SessionParams::default(),
            seq: CmdSequence::default(),
            irrelevant: IrrelevantKeys::new(),
            auth: rec.auth.clone(),
            provider: rec.provider,
            kernel_io: rec.provider.kernel_io(),
            retry: rec.retry,
            mainloop: Mainloop::new(),
            leading_cid: None,
            cnx: (0..ISCSI_CNX_MAX).map(|_| None).collect(),
            rec,
        })
    }

    /// Tear down every connection and release the provider binding
    pub fn destroy(mut self, providers: &mut ProviderTable) {
        for cid in 0..ISCSI_CNX_MAX as u16 {
            self.cnx_destroy(cid);
        }
        providers.unbind(self.provider, self.id);
        log::info!("session {}: destroyed", self.id.0);
    }

    /// Occupy connection slot `cid`
    pub fn cnx_create(&mut self, cid: u16, mut transport: Box<dyn Transport>) -> IscsiResult<()> {
        let slot = self
            .cnx
            .get_mut(cid as usize)
            .ok_or_else(|| IscsiError::Session(format!("cid {} out of range", cid)))?;
        if slot.is_some() {
            return Err(IscsiError::Session(format!("cid {} already in use", cid)));
        }

        transport.configure(self.rec.tcp_window_size, self.rec.type_of_service);
        let mut conn = Connection::new(cid, self.id, self.rec.portal.clone(), transport);
        conn.timeouts = self.rec.timeouts;
        conn.header_digest_pref = self.rec.header_digest;
        conn.data_digest_pref = self.rec.data_digest;
        conn.max_recv_data_segment_len = self.rec.max_recv_data_segment_len;
        conn.tcp_window_size = self.rec.tcp_window_size;
        conn.type_of_service = self.rec.type_of_service;

        *slot = Some(conn);
        log::debug!("session {}: cid {} created", self.id.0, cid);
        Ok(())
    }

    /// Disconnect and free connection slot `cid`
    pub fn cnx_destroy(&mut self, cid: u16) {
        self.release_leading(cid);
        if let Some(mut conn) = self.take_cnx(cid) {
            conn.disconnect(&mut self.mainloop);
            log::debug!("session {}: cid {} destroyed", self.id.0, cid);
        }
    }

    pub fn connection(&self, cid: u16) -> Option<&Connection> {
        self.cnx.get(cid as usize).and_then(Option::as_ref)
    }

    pub fn connection_mut(&mut self, cid: u16) -> Option<&mut Connection> {
        self.cnx.get_mut(cid as usize).and_then(Option::as_mut)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.cnx.iter().flatten()
    }

    /// Connection whose login will establish the session, if one is running
    pub fn leading_cid(&self) -> Option<u16> {
        self.leading_cid
    }

    /// Reserve the leading login for `cid`
    ///
    /// Only one connection may log in with TSIH 0; the others wait until the
    /// session exists. A no-op once the TSIH is known.
    pub(crate) fn claim_leading(&mut self, cid: u16) -> IscsiResult<()> {
        if self.tsih != 0 {
            self.leading_cid = None;
            return Ok(());
        }
        match self.leading_cid {
            Some(leader) if leader != cid => Err(IscsiError::Session(format!(
                "cid {} cannot log in while cid {} runs the leading login",
                cid, leader
            ))),
            _ => {
                self.leading_cid = Some(cid);
                Ok(())
            }
        }
    }

    fn release_leading(&mut self, cid: u16) {
        if self.leading_cid == Some(cid) {
            self.leading_cid = None;
        }
    }

    /// A connection is taken out of its slot while its handler runs
    fn take_cnx(&mut self, cid: u16) -> Option<Connection> {
        self.cnx.get_mut(cid as usize).and_then(Option::take)
    }

    fn restore_cnx(&mut self, conn: Connection) {
        let cid = conn.cid as usize;
        self.cnx[cid] = Some(conn);
    }

    /// Start logging in connection `cid`
    ///
    /// Returns an outcome only if the attempt ended immediately.
    pub fn connect(&mut self, cid: u16, now: Instant) -> IscsiResult<Option<LoginOutcome>> {
        if self.connection(cid).is_none() {
            return Err(IscsiError::Session(format!("cid {} does not exist", cid)));
        }
        self.claim_leading(cid)?;
        let mut conn = self
            .take_cnx(cid)
            .ok_or_else(|| IscsiError::Session(format!("cid {} does not exist", cid)))?;
        conn.retries = 0;
        conn.redirects = 0;

        let settled = conn
            .connect(&mut self.mainloop, now, false)
            .and_then(|status| self.settle(&mut conn, status, now));
        Ok(self.finish_event(conn, settled))
    }

    /// Log in connection `cid` synchronously over its transport
    pub fn login(&mut self, cid: u16) -> IscsiResult<LoginStatus> {
        if self.connection(cid).is_none() {
            return Err(IscsiError::Session(format!("cid {} does not exist", cid)));
        }
        self.claim_leading(cid)?;
        let mut conn = self
            .take_cnx(cid)
            .ok_or_else(|| IscsiError::Session(format!("cid {} does not exist", cid)))?;
        let status = login::login(self, &mut conn);
        self.release_leading(cid);
        self.restore_cnx(conn);
        Ok(status)
    }

    /// Abort whatever connection `cid` is doing; the slot stays allocated
    pub fn disconnect(&mut self, cid: u16) {
        self.release_leading(cid);
        if let Some(mut conn) = self.take_cnx(cid) {
            conn.disconnect(&mut self.mainloop);
            self.restore_cnx(conn);
        }
    }

    /// Run one pass of the session's event loop
    ///
    /// Fires due timers, polls every connection waiting on its transport and
    /// dispatches the queue until it is empty. Returns every login that
    /// finished for good during the pass.
    pub fn process_events(&mut self, now: Instant) -> Vec<LoginOutcome> {
        self.mainloop.fire_expired(now);
        self.poll_connections();

        let mut outcomes = Vec::new();
        while let Some(event) = self.mainloop.pop() {
            let Some(mut conn) = self.take_cnx(event.cid) else {
                log::debug!("session {}: dropping {:?} for free cid", self.id.0, event);
                continue;
            };
            let settled = conn
                .handle_event(self, event.kind, now)
                .and_then(|status| self.settle(&mut conn, status, now));
            outcomes.extend(self.finish_event(conn, settled));
        }
        outcomes
    }

    fn poll_connections(&mut self) {
        for conn in self.cnx.iter_mut().flatten() {
            match conn.state {
                ConnState::WaitConnect => self.mainloop.post(Event::new(conn.cid, EventKind::Poll)),
                ConnState::WaitPduResponse => match conn.transport.poll() {
                    Ok(Readiness::Readable) | Err(_) => {
                        self.mainloop.post(Event::new(conn.cid, EventKind::RecvPdu))
                    }
                    Ok(_) => {}
                },
                ConnState::Idle => {}
            }
        }
    }

    /// Apply the retry policy to a finished attempt
    fn settle(
        &mut self,
        conn: &mut Connection,
        mut status: CnxLoginStatus,
        now: Instant,
    ) -> Option<LoginOutcome> {
        loop {
            match status {
                CnxLoginStatus::Success => {
                    conn.retries = 0;
                    conn.redirects = 0;
                    log::info!(
                        "session {}: cid {} logged in to {} (TSIH {})",
                        self.id.0,
                        conn.cid,
                        conn.portal,
                        self.tsih
                    );
                    return Some(conn.outcome());
                }
                CnxLoginStatus::ImmRedirectRetry if conn.redirects < self.retry.max_redirects => {
                    conn.redirects += 1;
                    log::info!(
                        "session {}: cid {} redirected to {} ({}/{})",
                        self.id.0,
                        conn.cid,
                        conn.portal,
                        conn.redirects,
                        self.retry.max_redirects
                    );
                    match conn.connect(&mut self.mainloop, now, true) {
                        Some(next) => status = next,
                        None => return None,
                    }
                }
                CnxLoginStatus::ImmRetry if conn.retries < self.retry.login_retries => {
                    conn.retries += 1;
                    log::info!(
                        "session {}: cid {} retrying login now ({}/{})",
                        self.id.0,
                        conn.cid,
                        conn.retries,
                        self.retry.login_retries
                    );
                    match conn.connect(&mut self.mainloop, now, false) {
                        Some(next) => status = next,
                        None => return None,
                    }
                }
                CnxLoginStatus::Retry if conn.retries < self.retry.login_retries => {
                    conn.retries += 1;
                    let wait = Duration::from_secs(u64::from(self.params.default_time2wait));
                    log::info!(
                        "session {}: cid {} retrying login in {:?} ({}/{})",
                        self.id.0,
                        conn.cid,
                        wait,
                        conn.retries,
                        self.retry.login_retries
                    );
                    self.mainloop.schedule(conn.cid, TimerKind::Reconnect, wait, now);
                    return None;
                }
                _ => {
                    if status == CnxLoginStatus::ImmRedirectRetry {
                        conn.login_status = LoginStatus::RedirectionFailed;
                    }
                    log::warn!(
                        "session {}: cid {} giving up: {:?} ({})",
                        self.id.0,
                        conn.cid,
                        status,
                        conn.login_status
                    );
                    return Some(conn.outcome());
                }
            }
        }
    }

    /// Put the connection back, or free its slot if its login was abandoned
    fn finish_event(&mut self, mut conn: Connection, settled: Option<LoginOutcome>) -> Option<LoginOutcome> {
        if settled.is_some() {
            self.release_leading(conn.cid);
        }
        match &settled {
            Some(outcome) if outcome.status != CnxLoginStatus::Success => {
                conn.disconnect(&mut self.mainloop);
                log::debug!("session {}: cid {} released", self.id.0, conn.cid);
            }
            _ => self.restore_cnx(conn),
        }
        settled
    }

    /// A session with no connections left is dead
    pub fn is_dead(&self) -> bool {
        self.cnx.iter().all(Option::is_none)
    }

    /// Allocate a CmdSN for a non-immediate command
    pub fn next_cmdsn(&mut self) -> IscsiResult<u32> {
        self.seq.next_cmdsn()
    }

    /// Close the session: Logout on a logged-in connection, then drop every connection
    pub fn logout(&mut self, timeout: Duration) -> IscsiResult<()> {
        let leader = self.connections().find(|c| c.is_logged_in()).map(|c| c.cid);
        let result = match leader {
            Some(cid) => self.logout_exchange(cid, timeout),
            None => Ok(()),
        };

        for cid in 0..ISCSI_CNX_MAX as u16 {
            self.cnx_destroy(cid);
        }
        result
    }

    fn logout_exchange(&mut self, cid: u16, timeout: Duration) -> IscsiResult<()> {
        let itt = self.seq.next_itt();
        let cmdsn = self.seq.cmdsn;
        let conn = self
            .cnx
            .get_mut(cid as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| IscsiError::Session(format!("cid {} does not exist", cid)))?;

        log::info!("session {}: logging out on cid {}", self.id.0, cid);
        let request =
            IscsiPdu::logout_request(itt, logout_reason::CLOSE_SESSION, cid, cmdsn, conn.exp_statsn);
        let (hd, dd) = (conn.header_digest.enabled(), conn.data_digest.enabled());
        conn.transport.send_pdu(&request, hd, dd, timeout)?;

        let reply = conn
            .transport
            .recv_pdu(hd, dd, conn.max_recv_data_segment_len as usize, timeout)?
            .parse_logout_response()?;
        if reply.itt != itt {
            return Err(IscsiError::InvalidPdu(format!(
                "Logout Response ITT 0x{:08x}, expected 0x{:08x}",
                reply.itt, itt
            )));
        }
        conn.exp_statsn = reply.stat_sn.wrapping_add(1);
        self.seq.update(reply.exp_cmd_sn, reply.max_cmd_sn);

        match reply.response {
            logout_response::SUCCESS => Ok(()),
            code => Err(IscsiError::Session(format!("logout refused with response {}", code))),
        }
    }

    /// True once `key` has been fixed by the leading login
    pub fn is_irrelevant(&self, key: &str) -> bool {
        self.irrelevant.is_irrelevant(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderStatus;

    fn record() -> NodeRecord {
        NodeRecord::builder()
            .initiator_name("iqn.2024-01.com.example:host1")
            .target_name("iqn.2024-01.com.example:storage")
            .portal("127.0.0.1:3260")
            .build()
            .unwrap()
    }

    #[test]
    fn test_session_params_round_trip_through_text() {
        let mut params = SessionParams::default();
        params.apply(params::MAX_BURST_LENGTH, "131072").unwrap();
        params.apply(params::IMMEDIATE_DATA, "No").unwrap();
        params.apply(params::DEFAULT_TIME2WAIT, "0x0a").unwrap();

        assert_eq!(params.max_burst_length, 131072);
        assert!(!params.immediate_data);
        assert_eq!(params.default_time2wait, 10);
        assert_eq!(params.value(params::IMMEDIATE_DATA).as_deref(), Some("No"));
        assert_eq!(params.value(params::HEADER_DIGEST), None);

        assert!(params.apply(params::INITIAL_R2T, "maybe").is_err());
        assert!(params.apply(params::MAX_CONNECTIONS, "70000").is_err());
    }

    #[test]
    fn test_serial_arithmetic_wraps() {
        assert!(sn_lt(1, 2));
        assert!(sn_lt(0xFFFF_FFFF, 0));
        assert!(sn_gt(3, 0xFFFF_FFF0));
        assert!(!sn_lt(5, 5));
    }

    #[test]
    fn test_itt_skips_reserved_tag() {
        let mut seq = CmdSequence {
            itt: 0xFFFF_FFFE,
            ..CmdSequence::default()
        };
        assert_eq!(seq.next_itt(), 0xFFFF_FFFE);
        assert_eq!(seq.next_itt(), 0);
    }

    #[test]
    fn test_cmdsn_window() {
        let mut seq = CmdSequence::default();
        assert_eq!(seq.next_cmdsn().unwrap(), 1);
        assert!(seq.next_cmdsn().is_err());

        assert!(seq.update(2, 5));
        assert_eq!(seq.next_cmdsn().unwrap(), 2);
        assert_eq!(seq.exp_cmdsn, 2);
        assert_eq!(seq.max_cmdsn, 5);
    }

    #[test]
    fn test_window_update_ignored_when_inverted() {
        let mut seq = CmdSequence::default();
        assert!(seq.update(10, 20));
        // MaxCmdSN < ExpCmdSN - 1
        assert!(!seq.update(30, 25));
        assert_eq!((seq.exp_cmdsn, seq.max_cmdsn), (10, 20));

        // Stale values never move the window backwards
        assert!(seq.update(5, 8));
        assert_eq!((seq.exp_cmdsn, seq.max_cmdsn), (10, 20));
        assert_eq!(seq.cmdsn, 10);
    }

    #[test]
    fn test_seed_can_close_the_window() {
        let mut seq = CmdSequence::default();
        assert!(seq.seed(1, 0));
        assert_eq!((seq.cmdsn, seq.exp_cmdsn, seq.max_cmdsn), (1, 1, 0));
        assert!(!seq.window_open());
        assert!(seq.next_cmdsn().is_err());

        assert!(!seq.seed(9, 3));
        assert_eq!((seq.exp_cmdsn, seq.max_cmdsn), (1, 0));
    }

    #[test]
    fn test_create_binds_provider() {
        let mut providers = ProviderTable::init();
        let session = Session::create(SessionId(7), record(), &mut providers).unwrap();
        assert!(!session.kernel_io);
        assert!(session.is_dead());
        assert_eq!(
            providers.lookup(ProviderType::SoftTcp).unwrap().sessions,
            vec![SessionId(7)]
        );

        session.destroy(&mut providers);
        assert!(providers.lookup(ProviderType::SoftTcp).unwrap().sessions.is_empty());
    }

    #[test]
    fn test_create_fails_without_operational_provider() {
        let mut providers = ProviderTable::init();
        providers
            .set_status(ProviderType::SoftTcp, ProviderStatus::Failed)
            .unwrap();
        assert!(Session::create(SessionId(1), record(), &mut providers).is_err());

        let mut rec = record();
        rec.provider = ProviderType::Iser;
        providers
            .set_status(ProviderType::Iser, ProviderStatus::Operational)
            .unwrap();
        let session = Session::create(SessionId(2), rec, &mut providers).unwrap();
        assert!(session.kernel_io);
    }

    #[test]
    fn test_connection_slots() {
        let mut providers = ProviderTable::init();
        let mut session = Session::create(SessionId(1), record(), &mut providers).unwrap();

        session
            .cnx_create(0, Box::new(crate::transport::TcpTransport::new()))
            .unwrap();
        assert!(session
            .cnx_create(0, Box::new(crate::transport::TcpTransport::new()))
            .is_err());
        assert!(session
            .cnx_create(ISCSI_CNX_MAX as u16, Box::new(crate::transport::TcpTransport::new()))
            .is_err());

        assert_eq!(session.connection(0).unwrap().cid, 0);
        assert_eq!(session.connection(0).unwrap().session, SessionId(1));
        assert!(!session.is_dead());

        session.cnx_destroy(0);
        assert!(session.is_dead());
    }
}
