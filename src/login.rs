//! Login phase (RFC 3720 Section 5.3)
//!
//! One [`LoginContext`] exists per login attempt on a connection. The state
//! machine itself performs no I/O: [`login_begin`] prepares an attempt,
//! [`login_req`] builds the next Login Request and [`login_rsp`] consumes the
//! matching Login Response. [`login`] drives the same rounds blocking over
//! the connection's transport.
//!
//! A response is validated completely before anything in the session or
//! connection is touched, so a rejected PDU leaves no trace.

use crate::auth::{AuthClient, AuthMethod, AuthVerdict, CredentialBlock};
use crate::connection::Connection;
use crate::error::{decode_login_status, IscsiError, IscsiResult};
use crate::params::{
    self, answer, DigestType, Direction, IrrelevantKeys, ResultFn, Scope, DEFAULT_SEGMENT_LENGTH,
};
use crate::pdu::{self, login_status, IscsiPdu, LoginResponse, LoginStage};
use crate::session::{Session, SessionParams, SessionType};
use std::fmt;
use std::time::Duration;

/// Bound on the text accumulated from a partial (C bit) response
pub const LOGIN_BUFFER_SIZE: usize = 65536;

/// Request/response rounds allowed before a blocking login gives up
const MAX_LOGIN_ROUNDS: usize = 64;

/// Outcome of a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Ok,
    IoError,
    Failed,
    VersionMismatch,
    NegotiationFailed,
    AuthenticationFailed,
    WrongPortalGroup,
    RedirectionFailed,
    InvalidPdu,
}

impl LoginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStatus::Ok => "LOGIN_OK",
            LoginStatus::IoError => "LOGIN_IO_ERROR",
            LoginStatus::Failed => "LOGIN_FAILED",
            LoginStatus::VersionMismatch => "LOGIN_VERSION_MISMATCH",
            LoginStatus::NegotiationFailed => "LOGIN_NEGOTIATION_FAILED",
            LoginStatus::AuthenticationFailed => "LOGIN_AUTHENTICATION_FAILED",
            LoginStatus::WrongPortalGroup => "LOGIN_WRONG_PORTAL_GROUP",
            LoginStatus::RedirectionFailed => "LOGIN_REDIRECTION_FAILED",
            LoginStatus::InvalidPdu => "LOGIN_INVALID_PDU",
        }
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller does after a Login Response has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginProgress {
    /// Send the next Login Request
    Continue,
    /// The target moved; the connection now points at the new portal
    Redirected,
    Finished(LoginStatus),
}

/// Negotiation cursor of one login attempt
#[derive(Debug)]
pub struct LoginContext {
    pub cid: u16,
    /// Text of a partial response, accumulated until the final fragment
    pub buffer: Vec<u8>,
    pub bufsize: usize,
    pub status_class: u8,
    pub status_detail: u8,
    pub auth_client: Option<Box<dyn AuthClient>>,
    /// Last request built
    pub pdu: Option<IscsiPdu>,
    /// Last response accepted by the header checks
    pub login_rsp: Option<LoginResponse>,
    /// Text segment of the request being built
    pub data: Vec<u8>,
    pub max_data_length: usize,
    pub received_pdu: bool,
    pub timeout: Duration,
    pub final_pdu: bool,
    pub ret: LoginStatus,
    pub kernel_io: bool,
    pub itt: u32,
    /// TSIH was zero when the attempt began
    pub leading: bool,
    stat_sn_valid: bool,
    transit_requested: bool,
    /// Operational keys proposed by us, sent once per attempt
    proposed: Vec<(String, String)>,
    op_proposed: bool,
    /// Answers owed to keys the target offered first
    replies: Vec<(String, String)>,
    /// Values agreed so far
    negotiated: Vec<(String, String)>,
    /// Keys the target declared Irrelevant
    irrelevant: IrrelevantKeys,
    offered_methods: Vec<AuthMethod>,
    auth_method: Option<AuthMethod>,
    pub auth_verdict: AuthVerdict,
    auth_send: CredentialBlock,
}

impl LoginContext {
    pub fn new(cid: u16, buffer: Vec<u8>, max_data_length: usize) -> Self {
        LoginContext {
            cid,
            buffer,
            bufsize: LOGIN_BUFFER_SIZE,
            status_class: 0,
            status_detail: 0,
            auth_client: None,
            pdu: None,
            login_rsp: None,
            data: Vec::new(),
            max_data_length,
            received_pdu: false,
            timeout: Duration::ZERO,
            final_pdu: false,
            ret: LoginStatus::Ok,
            kernel_io: false,
            itt: 0,
            leading: false,
            stat_sn_valid: false,
            transit_requested: false,
            proposed: Vec::new(),
            op_proposed: false,
            replies: Vec::new(),
            negotiated: Vec::new(),
            irrelevant: IrrelevantKeys::new(),
            offered_methods: Vec::new(),
            auth_method: None,
            auth_verdict: AuthVerdict::Continue,
            auth_send: CredentialBlock::new(),
        }
    }

    /// Append `key=value\0` to the request text. On overflow nothing is appended.
    pub fn add_text(&mut self, key: &str, value: &str) -> IscsiResult<()> {
        let needed = self.data.len() + key.len() + value.len() + 2;
        if needed > self.max_data_length {
            return Err(IscsiError::BufferOverflow {
                needed,
                available: self.max_data_length,
            });
        }
        self.data.extend_from_slice(key.as_bytes());
        self.data.push(b'=');
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Build the Login Request carrying the current text
    pub fn build_request(
        &mut self,
        session: &Session,
        exp_statsn: u32,
        csg: LoginStage,
        nsg: LoginStage,
        transit: bool,
    ) -> IscsiResult<IscsiPdu> {
        let wire = |stage: LoginStage| {
            stage
                .to_wire()
                .ok_or_else(|| IscsiError::Session(format!("stage {:?} is not sent on the wire", stage)))
        };
        let pdu = IscsiPdu::login_request(
            session.isid,
            session.tsih,
            self.itt,
            self.cid,
            session.seq.cmdsn,
            exp_statsn,
            wire(csg)?,
            wire(nsg)?,
            transit,
            false,
            self.data.clone(),
        );
        self.pdu = Some(pdu.clone());
        Ok(pdu)
    }

    /// Decode a Login Response and check what does not depend on session state
    pub fn parse_response(&mut self, pdu: &IscsiPdu) -> IscsiResult<LoginResponse> {
        let rsp = pdu.parse_login_response()?;
        if rsp.itt != self.itt {
            return Err(IscsiError::InvalidPdu(format!(
                "Login Response ITT 0x{:08x}, expected 0x{:08x}",
                rsp.itt, self.itt
            )));
        }

        self.received_pdu = true;
        self.status_class = rsp.status_class;
        self.status_detail = rsp.status_detail;

        if rsp.status_class == login_status::SUCCESS && rsp.version_active != pdu::ISCSI_DRAFT20_VERSION {
            return Err(IscsiError::VersionMismatch {
                max: rsp.version_max,
                active: rsp.version_active,
            });
        }
        Ok(rsp)
    }

    fn negotiated_value(&self, key: &str) -> Option<&str> {
        self.negotiated
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn proposed_value(&self, key: &str) -> Option<&str> {
        self.proposed
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn record(&mut self, key: &str, value: &str) {
        match self.negotiated.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.negotiated.push((key.to_string(), value.to_string())),
        }
    }
}

/// Start a login attempt on a connected transport
pub fn login_begin(session: &mut Session, conn: &mut Connection) -> IscsiResult<()> {
    if conn.session != session.id {
        return Err(IscsiError::Session(format!(
            "cid {} belongs to session {}, not {}",
            conn.cid, conn.session.0, session.id.0
        )));
    }
    session.claim_leading(conn.cid)?;
    conn.release_login_context();

    conn.max_xmit_data_segment_len = DEFAULT_SEGMENT_LENGTH;
    let buffer = std::mem::take(&mut conn.rx_buffer);
    let mut ctx = LoginContext::new(conn.cid, buffer, conn.max_xmit_data_segment_len as usize);
    ctx.itt = session.seq.next_itt();
    ctx.leading = session.tsih == 0;
    ctx.auth_client = session.auth.client();
    ctx.kernel_io = session.kernel_io;

    conn.current_stage = LoginStage::Initial;
    conn.next_stage = LoginStage::Initial;
    conn.partial_response = false;

    log::info!(
        "session {}: cid {} starting {} login (ITT 0x{:08x}, auth {})",
        session.id.0,
        conn.cid,
        if ctx.leading { "leading" } else { "non-leading" },
        ctx.itt,
        if ctx.auth_client.is_some() { "CHAP" } else { "none" }
    );
    conn.login_context = Some(ctx);
    Ok(())
}

/// Build the next Login Request for the attempt in progress
pub fn login_req(session: &mut Session, conn: &mut Connection) -> IscsiResult<IscsiPdu> {
    let mut ctx = conn
        .login_context
        .take()
        .ok_or_else(|| IscsiError::Session(format!("cid {}: no login in progress", conn.cid)))?;
    let result = next_request(session, conn, &mut ctx);
    conn.login_context = Some(ctx);
    result
}

fn next_request(session: &Session, conn: &mut Connection, ctx: &mut LoginContext) -> IscsiResult<IscsiPdu> {
    ctx.data.clear();
    ctx.received_pdu = false;

    if conn.partial_response {
        // Empty request at the same stage to collect the rest of the text
        ctx.transit_requested = false;
        ctx.timeout = conn.round_timeout();
        return ctx.build_request(session, conn.exp_statsn, conn.current_stage, conn.next_stage, false);
    }

    if conn.current_stage == LoginStage::Initial {
        ctx.add_text(params::INITIATOR_NAME, &session.initiator_name)?;
        if let Some(alias) = &session.initiator_alias {
            ctx.add_text(params::INITIATOR_ALIAS, alias)?;
        }
        if ctx.leading {
            ctx.add_text(params::SESSION_TYPE, session.session_type.as_str())?;
        }
        if session.session_type == SessionType::Normal {
            ctx.add_text(params::TARGET_NAME, &session.target_name)?;
        }
        conn.current_stage = if ctx.auth_client.is_some() {
            LoginStage::Security
        } else {
            LoginStage::Operational
        };
    }

    let transit = match conn.current_stage {
        LoginStage::Security => {
            conn.next_stage = LoginStage::Operational;
            security_keys(ctx)?
        }
        LoginStage::Operational => {
            conn.next_stage = LoginStage::FullFeature;
            operational_keys(session, conn, ctx)?;
            true
        }
        stage => {
            return Err(IscsiError::Session(format!(
                "cid {}: no Login Request is sent in stage {:?}",
                conn.cid, stage
            )))
        }
    };

    for (key, value) in std::mem::take(&mut ctx.replies) {
        ctx.add_text(&key, &value)?;
    }

    ctx.transit_requested = transit;
    ctx.timeout = conn.round_timeout();
    log::debug!(
        "cid {}: Login Request CSG {:?} NSG {:?} T {} ({} bytes of text)",
        conn.cid,
        conn.current_stage,
        conn.next_stage,
        transit,
        ctx.data.len()
    );
    ctx.build_request(session, conn.exp_statsn, conn.current_stage, conn.next_stage, transit)
}

/// Security stage text; returns whether to request a transit
fn security_keys(ctx: &mut LoginContext) -> IscsiResult<bool> {
    let Some(client) = ctx.auth_client.as_ref() else {
        return Err(IscsiError::Auth("security stage without an authentication client".to_string()));
    };

    if ctx.auth_method.is_none() {
        let offered = client.methods();
        let list = offered
            .iter()
            .map(AuthMethod::as_str)
            .collect::<Vec<_>>()
            .join(",");
        ctx.add_text(params::AUTH_METHOD, &list)?;
        let transit = offered.contains(&AuthMethod::None);
        ctx.offered_methods = offered;
        return Ok(transit);
    }

    let transit = client.transit_ready();
    for (key, value) in ctx.auth_send.to_keys() {
        ctx.add_text(&key, &value)?;
    }
    Ok(transit)
}

/// What we offer for a key
fn offer_value(session: &Session, conn: &Connection, key: &str) -> Option<String> {
    match key {
        params::HEADER_DIGEST => Some(conn.header_digest_pref.offer().to_string()),
        params::DATA_DIGEST => Some(conn.data_digest_pref.offer().to_string()),
        params::MAX_RECV_DATA_SEGMENT_LENGTH => Some(conn.max_recv_data_segment_len.to_string()),
        params::IF_MARKER | params::OF_MARKER => Some("No".to_string()),
        _ => session.rec.session.value(key),
    }
}

/// Operational stage proposal, taken from the key registry
fn operational_keys(session: &Session, conn: &Connection, ctx: &mut LoginContext) -> IscsiResult<()> {
    if ctx.op_proposed {
        return Ok(());
    }

    let proposal: Vec<(String, String)> = params::KEYS
        .iter()
        .filter(|k| k.direction != Direction::Target && k.name != params::AUTH_METHOD)
        .filter(|k| k.result != ResultFn::Declarative || k.name == params::MAX_RECV_DATA_SEGMENT_LENGTH)
        .filter(|k| session.session_type == SessionType::Normal || k.discovery)
        .filter(|k| k.scope == Scope::Connection || (ctx.leading && !session.irrelevant.is_irrelevant(k.name)))
        .filter_map(|k| offer_value(session, conn, k.name).map(|v| (k.name.to_string(), v)))
        .collect();

    for (key, value) in &proposal {
        ctx.add_text(key, value)?;
    }
    ctx.proposed = proposal;
    ctx.op_proposed = true;
    Ok(())
}

/// Process a Login Response for the attempt in progress
pub fn login_rsp(session: &mut Session, conn: &mut Connection, pdu: &IscsiPdu) -> LoginProgress {
    let Some(mut ctx) = conn.login_context.take() else {
        log::warn!("cid {}: Login Response with no login in progress", conn.cid);
        return LoginProgress::Finished(LoginStatus::InvalidPdu);
    };

    let progress = process_response(session, conn, &mut ctx, pdu);
    if let LoginProgress::Finished(status) = progress {
        ctx.ret = status;
        ctx.final_pdu = true;
        if status != LoginStatus::Ok {
            log::warn!("session {}: cid {} login failed: {}", session.id.0, conn.cid, status);
        }
    }

    conn.login_context = Some(ctx);
    progress
}

fn process_response(
    session: &mut Session,
    conn: &mut Connection,
    ctx: &mut LoginContext,
    pdu: &IscsiPdu,
) -> LoginProgress {
    use LoginProgress::Finished;

    let rsp = match ctx.parse_response(pdu) {
        Ok(rsp) => rsp,
        Err(IscsiError::VersionMismatch { max, active }) => {
            log::warn!("cid {}: target speaks version {} (max {})", conn.cid, active, max);
            return Finished(LoginStatus::VersionMismatch);
        }
        Err(e) => {
            log::warn!("cid {}: {}", conn.cid, e);
            return Finished(LoginStatus::InvalidPdu);
        }
    };

    log::debug!(
        "cid {}: Login Response CSG {} NSG {} T {} C {} StatSN {} status 0x{:02x}/0x{:02x}",
        conn.cid,
        rsp.csg,
        rsp.nsg,
        rsp.transit,
        rsp.cont,
        rsp.stat_sn,
        rsp.status_class,
        rsp.status_detail
    );

    match rsp.status_class {
        login_status::SUCCESS => {}
        login_status::REDIRECTION => return redirect(session, conn, &rsp),
        login_status::INITIATOR_ERROR => {
            log::error!(
                "cid {}: login rejected: {}",
                conn.cid,
                decode_login_status(rsp.status_class, rsp.status_detail)
            );
            return Finished(match rsp.status_detail {
                login_status::AUTH_FAILURE | login_status::AUTHORIZATION_FAILURE => {
                    LoginStatus::AuthenticationFailed
                }
                login_status::UNSUPPORTED_VERSION => LoginStatus::VersionMismatch,
                _ => LoginStatus::Failed,
            });
        }
        login_status::TARGET_ERROR => {
            log::error!(
                "cid {}: target error: {}",
                conn.cid,
                decode_login_status(rsp.status_class, rsp.status_detail)
            );
            return Finished(LoginStatus::Failed);
        }
        class => {
            log::warn!("cid {}: unknown login status class 0x{:02x}", conn.cid, class);
            return Finished(LoginStatus::InvalidPdu);
        }
    }

    if let Err(status) = check_header(session, conn, ctx, &rsp) {
        return Finished(status);
    }

    // Text is only split once the final fragment is in
    let keys = if rsp.cont {
        if ctx.buffer.len() + rsp.data.len() > ctx.bufsize {
            log::warn!(
                "cid {}: partial Login Response exceeds {} bytes",
                conn.cid,
                ctx.bufsize
            );
            return Finished(LoginStatus::Failed);
        }
        None
    } else {
        let mut text = std::mem::take(&mut ctx.buffer);
        text.extend_from_slice(&rsp.data);
        let parsed = pdu::parse_text_parameters(&text);
        text.clear();
        ctx.buffer = text;
        match parsed {
            Ok(keys) => Some(keys),
            Err(e) => {
                log::warn!("cid {}: {}", conn.cid, e);
                return Finished(LoginStatus::InvalidPdu);
            }
        }
    };

    // Header accepted
    conn.exp_statsn = rsp.stat_sn.wrapping_add(1);
    let first_response = !ctx.stat_sn_valid;
    ctx.stat_sn_valid = true;
    if ctx.leading {
        let taken = if first_response {
            session.seq.seed(rsp.exp_cmd_sn, rsp.max_cmd_sn)
        } else {
            session.seq.update(rsp.exp_cmd_sn, rsp.max_cmd_sn)
        };
        if !taken {
            log::debug!(
                "cid {}: ignoring ExpCmdSN {} MaxCmdSN {}",
                conn.cid,
                rsp.exp_cmd_sn,
                rsp.max_cmd_sn
            );
        }
    }

    let Some(keys) = keys else {
        ctx.buffer.extend_from_slice(&rsp.data);
        conn.partial_response = true;
        log::debug!("cid {}: partial response, {} bytes held", conn.cid, ctx.buffer.len());
        ctx.login_rsp = Some(rsp);
        return LoginProgress::Continue;
    };
    conn.partial_response = false;

    let (auth_keys, op_keys): (Vec<_>, Vec<_>) = keys.into_iter().partition(|(k, _)| is_security_key(k));

    for (key, value) in &op_keys {
        log::debug!("cid {}: target sent {}={}", conn.cid, key, value);
        if let Err(status) = negotiate_key(session, conn, ctx, key, value) {
            return Finished(status);
        }
    }

    if conn.current_stage == LoginStage::Security {
        if let Err(status) = process_security(conn.cid, ctx, &auth_keys, rsp.transit) {
            return Finished(status);
        }
    } else if !auth_keys.is_empty() {
        log::warn!("cid {}: security keys outside the security stage", conn.cid);
        return Finished(LoginStatus::NegotiationFailed);
    }

    let transit = rsp.transit;
    ctx.login_rsp = Some(rsp);
    if !transit {
        return LoginProgress::Continue;
    }

    match conn.next_stage {
        LoginStage::Operational => {
            log::info!("cid {}: security negotiation complete", conn.cid);
            conn.current_stage = LoginStage::Operational;
            conn.next_stage = LoginStage::FullFeature;
            LoginProgress::Continue
        }
        LoginStage::FullFeature if !ctx.replies.is_empty() => {
            // No request is left to carry the answers
            let keys: Vec<&str> = ctx.replies.iter().map(|(k, _)| k.as_str()).collect();
            log::warn!(
                "cid {}: target left full feature phase with {:?} unanswered",
                conn.cid,
                keys
            );
            Finished(LoginStatus::NegotiationFailed)
        }
        LoginStage::FullFeature => Finished(complete(session, conn, ctx)),
        _ => Finished(LoginStatus::InvalidPdu),
    }
}

/// Header checks that need session and connection state. Nothing is modified.
fn check_header(
    session: &Session,
    conn: &Connection,
    ctx: &LoginContext,
    rsp: &LoginResponse,
) -> Result<(), LoginStatus> {
    let invalid = |what: String| {
        log::warn!("cid {}: invalid Login Response: {}", conn.cid, what);
        Err(LoginStatus::InvalidPdu)
    };

    if rsp.isid != session.isid {
        return invalid(format!("ISID {:02x?}", rsp.isid));
    }
    if session.tsih != 0 && rsp.tsih != session.tsih {
        return invalid(format!("TSIH {} on session with TSIH {}", rsp.tsih, session.tsih));
    }
    if LoginStage::from_wire(rsp.csg) != Some(conn.current_stage) {
        return invalid(format!("CSG {} while in {:?}", rsp.csg, conn.current_stage));
    }
    if rsp.transit && rsp.cont {
        return invalid("both T and C set".to_string());
    }
    if rsp.transit {
        if !ctx.transit_requested {
            return invalid("transit that was not requested".to_string());
        }
        if LoginStage::from_wire(rsp.nsg) != Some(conn.next_stage) {
            return invalid(format!("NSG {} while {:?} was requested", rsp.nsg, conn.next_stage));
        }
        if conn.next_stage == LoginStage::FullFeature
            && ctx.leading
            && session.session_type == SessionType::Normal
            && rsp.tsih == 0
        {
            return invalid("zero TSIH on entering full feature phase".to_string());
        }
    }
    if ctx.stat_sn_valid && rsp.stat_sn != conn.exp_statsn {
        return invalid(format!("StatSN {}, expected {}", rsp.stat_sn, conn.exp_statsn));
    }
    Ok(())
}

fn is_security_key(key: &str) -> bool {
    key == params::AUTH_METHOD || key.starts_with("CHAP_")
}

/// Handle one operational (or declarative) key from the target
fn negotiate_key(
    session: &Session,
    conn: &Connection,
    ctx: &mut LoginContext,
    key: &str,
    value: &str,
) -> Result<(), LoginStatus> {
    if params::is_vendor_specific(key) {
        log::debug!("cid {}: ignoring vendor key {}", conn.cid, key);
        return Ok(());
    }
    let Some(def) = params::lookup(key) else {
        log::warn!("cid {}: unknown key {}={}", conn.cid, key, value);
        ctx.replies.push((key.to_string(), answer::NOT_UNDERSTOOD.to_string()));
        return Ok(());
    };

    match value {
        answer::IRRELEVANT => {
            log::debug!("cid {}: target finds {} irrelevant", conn.cid, key);
            ctx.irrelevant.mark(def.irrelevant);
            return Ok(());
        }
        answer::REJECT | answer::NOT_UNDERSTOOD => {
            log::warn!("cid {}: target answered {}={}", conn.cid, key, value);
            return Err(LoginStatus::NegotiationFailed);
        }
        _ => {}
    }

    if def.direction == Direction::Initiator {
        log::debug!("cid {}: ignoring initiator-only key {}", conn.cid, key);
        return Ok(());
    }

    // Fixed by the leading login
    if session.irrelevant.is_irrelevant(key) {
        return match session.params.value(key) {
            Some(fixed) if fixed == value => Ok(()),
            fixed => {
                log::warn!(
                    "cid {}: target renegotiates {}={} on a session that has {:?}",
                    conn.cid,
                    key,
                    value,
                    fixed
                );
                Err(LoginStatus::NegotiationFailed)
            }
        };
    }

    if let Err(e) = def.validate(value) {
        log::warn!("cid {}: {}", conn.cid, e);
        return Err(LoginStatus::NegotiationFailed);
    }

    if def.name == params::TARGET_PORTAL_GROUP_TAG {
        let tag = params::parse_number(value).and_then(|v| u16::try_from(v).ok());
        if let (Some(expected), Some(tag)) = (session.portal_group_tag, tag) {
            if expected != tag {
                log::error!(
                    "cid {}: portal group tag {} does not match configured {}",
                    conn.cid,
                    tag,
                    expected
                );
                return Err(LoginStatus::WrongPortalGroup);
            }
        }
        ctx.record(key, value);
        return Ok(());
    }

    if def.result == ResultFn::Declarative {
        ctx.record(key, value);
        return Ok(());
    }

    match ctx.proposed_value(key).map(str::to_string) {
        Some(ours) => {
            if let Err(e) = def.check_answer(&ours, value) {
                log::warn!("cid {}: {}", conn.cid, e);
                return Err(LoginStatus::NegotiationFailed);
            }
            ctx.record(key, value);
        }
        None => {
            if def.scope == Scope::Session && !ctx.leading {
                log::warn!("cid {}: target offers session key {} on a non-leading login", conn.cid, key);
                return Err(LoginStatus::NegotiationFailed);
            }
            let ours = offer_value(session, conn, key).unwrap_or_else(|| def.default.to_string());
            match def.resolve(&ours, value) {
                Some(reply) => {
                    ctx.replies.push((key.to_string(), reply.clone()));
                    ctx.record(key, &reply);
                }
                None => ctx.replies.push((key.to_string(), answer::REJECT.to_string())),
            }
        }
    }
    Ok(())
}

/// Feed the security keys of a response to the authentication client
fn process_security(
    cid: u16,
    ctx: &mut LoginContext,
    auth_keys: &[(String, String)],
    transit: bool,
) -> Result<(), LoginStatus> {
    let method = match ctx.auth_method {
        Some(method) => method,
        None => {
            let chosen = auth_keys
                .iter()
                .find(|(k, _)| k == params::AUTH_METHOD)
                .map(|(_, v)| v.as_str());
            let method = chosen
                .and_then(AuthMethod::from_str)
                .filter(|m| ctx.offered_methods.contains(m));
            let Some(method) = method else {
                log::warn!("cid {}: target chose AuthMethod {:?}", cid, chosen);
                return Err(LoginStatus::NegotiationFailed);
            };
            log::info!("cid {}: AuthMethod={}", cid, method.as_str());
            ctx.auth_method = Some(method);
            method
        }
    };

    let exchanged: Vec<(String, String)> = auth_keys
        .iter()
        .filter(|(k, _)| k != params::AUTH_METHOD)
        .cloned()
        .collect();
    let recv = match CredentialBlock::from_keys(&exchanged) {
        Ok(block) => block,
        Err(e) => {
            log::warn!("cid {}: {}", cid, e);
            return Err(LoginStatus::AuthenticationFailed);
        }
    };

    ctx.auth_send.clear();
    let Some(client) = ctx.auth_client.as_mut() else {
        return Err(LoginStatus::Failed);
    };
    let verdict = client.step(method, &recv, &mut ctx.auth_send);
    ctx.auth_verdict = verdict;

    match verdict {
        AuthVerdict::Fail => Err(LoginStatus::AuthenticationFailed),
        _ if transit && (verdict != AuthVerdict::Pass || !ctx.auth_send.is_empty()) => {
            log::warn!("cid {}: target left the security stage before authentication finished", cid);
            Err(LoginStatus::AuthenticationFailed)
        }
        _ => Ok(()),
    }
}

/// Commit the negotiated values on entering full feature phase
fn complete(session: &mut Session, conn: &mut Connection, ctx: &LoginContext) -> LoginStatus {
    if ctx.leading {
        // Keys the target never answered keep their RFC defaults
        let mut agreed = SessionParams::default();
        for (key, value) in &ctx.negotiated {
            let session_key = params::lookup(key).map(|d| d.irrelevant != 0).unwrap_or(false);
            if session_key {
                if let Err(e) = agreed.apply(key, value) {
                    log::warn!("cid {}: {}", conn.cid, e);
                    return LoginStatus::NegotiationFailed;
                }
            }
        }
        if session.session_type == SessionType::Normal && agreed.first_burst_length > agreed.max_burst_length {
            log::warn!(
                "cid {}: FirstBurstLength {} exceeds MaxBurstLength {}",
                conn.cid,
                agreed.first_burst_length,
                agreed.max_burst_length
            );
            return LoginStatus::NegotiationFailed;
        }

        let rsp_tsih = ctx.login_rsp.as_ref().map(|r| r.tsih).unwrap_or(0);
        session.tsih = rsp_tsih;
        session.params = agreed;
        if let Some(alias) = ctx.negotiated_value(params::TARGET_ALIAS) {
            session.target_alias = Some(alias.to_string());
        }
        if let Some(tag) = ctx
            .negotiated_value(params::TARGET_PORTAL_GROUP_TAG)
            .and_then(params::parse_number)
            .and_then(|v| u16::try_from(v).ok())
        {
            session.portal_group_tag = Some(tag);
        }
        let mut fixed = IrrelevantKeys::session_scoped();
        fixed.mark(ctx.irrelevant.bits());
        session.irrelevant = fixed;
        log::info!(
            "session {}: leading login complete, TSIH {} params {:?}",
            session.id.0,
            session.tsih,
            session.params
        );
    }

    let digest = |key: &str| {
        ctx.negotiated_value(key)
            .and_then(DigestType::from_value)
            .unwrap_or_default()
    };
    conn.header_digest = digest(params::HEADER_DIGEST);
    conn.data_digest = digest(params::DATA_DIGEST);
    conn.max_xmit_data_segment_len = ctx
        .negotiated_value(params::MAX_RECV_DATA_SEGMENT_LENGTH)
        .and_then(params::parse_number)
        .unwrap_or(DEFAULT_SEGMENT_LENGTH);
    conn.current_stage = LoginStage::FullFeature;
    conn.next_stage = LoginStage::FullFeature;

    log::info!(
        "cid {}: full feature phase (HeaderDigest {:?} DataDigest {:?} MaxXmitDataSegmentLength {})",
        conn.cid,
        conn.header_digest,
        conn.data_digest,
        conn.max_xmit_data_segment_len
    );
    LoginStatus::Ok
}

/// Log in a connection synchronously
///
/// Connects if needed and follows redirects up to the session's limit.
pub fn login(session: &mut Session, conn: &mut Connection) -> LoginStatus {
    let mut redirects = 0;
    loop {
        match login_once(session, conn) {
            LoginProgress::Redirected => {
                conn.transport.disconnect();
                redirects += 1;
                if redirects > session.retry.max_redirects {
                    log::warn!("cid {}: too many redirects", conn.cid);
                    conn.record_redirect_limit();
                    return LoginStatus::RedirectionFailed;
                }
                log::info!("cid {}: redirected to {}", conn.cid, conn.portal);
            }
            LoginProgress::Finished(status) => {
                conn.record_login(status);
                return status;
            }
            LoginProgress::Continue => {
                conn.record_login(LoginStatus::Failed);
                return LoginStatus::Failed;
            }
        }
    }
}

fn login_once(session: &mut Session, conn: &mut Connection) -> LoginProgress {
    use LoginProgress::Finished;

    if !conn.transport.is_connected() {
        if let Err(e) = conn.transport.connect(&conn.portal, false) {
            log::warn!("cid {}: connect to {} failed: {}", conn.cid, conn.portal, e);
            return Finished(LoginStatus::IoError);
        }
    }
    if let Err(e) = login_begin(session, conn) {
        log::warn!("cid {}: {}", conn.cid, e);
        return Finished(LoginStatus::Failed);
    }

    for _ in 0..MAX_LOGIN_ROUNDS {
        let request = match login_req(session, conn) {
            Ok(pdu) => pdu,
            Err(e) => {
                log::warn!("cid {}: cannot build Login Request: {}", conn.cid, e);
                return Finished(LoginStatus::Failed);
            }
        };
        if let Err(e) = conn.check_xmit_len(request.data.len()) {
            log::warn!("cid {}: {}", conn.cid, e);
            return Finished(LoginStatus::Failed);
        }

        let timeout = conn.round_timeout();
        if let Err(e) = conn.transport.send_pdu(&request, false, false, timeout) {
            log::warn!("cid {}: sending Login Request failed: {}", conn.cid, e);
            return Finished(LoginStatus::IoError);
        }
        let response = match conn.transport.recv_pdu(
            false,
            false,
            conn.max_recv_data_segment_len as usize,
            timeout,
        ) {
            Ok(pdu) => pdu,
            Err(IscsiError::InvalidPdu(msg)) => {
                log::warn!("cid {}: malformed Login Response: {}", conn.cid, msg);
                return Finished(LoginStatus::InvalidPdu);
            }
            Err(e) => {
                log::warn!("cid {}: receiving Login Response failed: {}", conn.cid, e);
                return Finished(LoginStatus::IoError);
            }
        };

        match login_rsp(session, conn, &response) {
            LoginProgress::Continue => continue,
            done => return done,
        }
    }

    log::warn!("cid {}: login did not finish in {} rounds", conn.cid, MAX_LOGIN_ROUNDS);
    Finished(LoginStatus::Failed)
}

fn redirect(session: &mut Session, conn: &mut Connection, rsp: &LoginResponse) -> LoginProgress {
    let address = pdu::parse_text_parameters(&rsp.data).ok().and_then(|keys| {
        keys.into_iter()
            .find(|(k, _)| k == params::TARGET_ADDRESS)
            .map(|(_, v)| v)
    });
    let Some(address) = address else {
        log::warn!("cid {}: redirect without TargetAddress", conn.cid);
        return LoginProgress::Finished(LoginStatus::RedirectionFailed);
    };

    match conn.update_address(&address) {
        Ok(tag) => {
            if rsp.status_detail == login_status::TARGET_MOVED_PERMANENTLY {
                log::warn!(
                    "cid {}: target moved permanently to {}; update the node record",
                    conn.cid,
                    address
                );
            } else {
                log::info!("cid {}: target moved temporarily to {}", conn.cid, address);
            }
            if let Some(tag) = tag {
                session.portal_group_tag = Some(tag);
            }
            LoginProgress::Redirected
        }
        Err(e) => {
            log::warn!("cid {}: bad TargetAddress {:?}: {}", conn.cid, address, e);
            LoginProgress::Finished(LoginStatus::RedirectionFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, ChapCredentials};
    use crate::config::NodeRecord;
    use crate::pdu::flags;
    use crate::provider::ProviderTable;
    use crate::session::SessionId;
    use crate::transport::TcpTransport;

    const ISID: [u8; 6] = crate::config::DEFAULT_ISID;

    fn request_keys(pdu: &IscsiPdu) -> Vec<(String, String)> {
        pdu::parse_text_parameters(&pdu.data).unwrap()
    }

    fn setup(auth: AuthConfig) -> (Session, Connection) {
        let rec = NodeRecord::builder()
            .initiator_name("iqn.2024-01.com.example:host1")
            .target_name("iqn.2024-01.com.example:disk1")
            .portal("127.0.0.1")
            .auth(auth)
            .build()
            .unwrap();
        let mut providers = ProviderTable::init();
        let session = Session::create(SessionId(1), rec.clone(), &mut providers).unwrap();
        let conn = Connection::new(0, SessionId(1), rec.portal, Box::new(TcpTransport::new()));
        (session, conn)
    }

    fn text(keys: &[(&str, &str)]) -> Vec<u8> {
        let owned: Vec<(String, String)> = keys
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pdu::serialize_text_parameters(&owned)
    }

    fn response(conn: &Connection, tsih: u16, stat_sn: u32, csg: u8, nsg: u8, transit: bool, data: Vec<u8>) -> IscsiPdu {
        let itt = conn.login_context.as_ref().unwrap().itt;
        IscsiPdu::login_response(ISID, tsih, stat_sn, 1, 1, 0, 0, csg, nsg, transit, itt, data)
    }

    #[test]
    fn test_add_text_overflow_leaves_data_untouched() {
        let mut ctx = LoginContext::new(0, Vec::new(), 16);
        ctx.add_text("A", "123456").unwrap();
        let before = ctx.data.clone();
        assert!(matches!(
            ctx.add_text("MaxBurstLength", "262144"),
            Err(IscsiError::BufferOverflow { .. })
        ));
        assert_eq!(ctx.data, before);
    }

    #[test]
    fn test_first_request_without_auth() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        let pdu = login_req(&mut session, &mut conn).unwrap();

        let req = pdu.parse_login_request().unwrap();
        assert_eq!(req.csg, 1);
        assert_eq!(req.nsg, 3);
        assert!(req.transit);
        assert_eq!(req.tsih, 0);

        let keys = request_keys(&pdu);
        assert_eq!(keys[0], ("InitiatorName".into(), "iqn.2024-01.com.example:host1".into()));
        assert!(keys.contains(&("SessionType".into(), "Normal".into())));
        assert!(keys.contains(&("TargetName".into(), "iqn.2024-01.com.example:disk1".into())));
        assert!(keys.contains(&("MaxBurstLength".into(), "262144".into())));
        assert!(keys.contains(&("MaxRecvDataSegmentLength".into(), "8192".into())));
        assert!(!keys.iter().any(|(k, _)| k == "AuthMethod" || k == "TargetAlias"));
    }

    #[test]
    fn test_first_request_with_chap_offers_methods() {
        let (mut session, mut conn) =
            setup(AuthConfig::chap(ChapCredentials::new("user", "secretsecret1")).allow_none());
        login_begin(&mut session, &mut conn).unwrap();
        let pdu = login_req(&mut session, &mut conn).unwrap();
        let req = pdu.parse_login_request().unwrap();

        assert_eq!((req.csg, req.nsg), (0, 1));
        assert!(req.transit);
        assert!(request_keys(&pdu).contains(&("AuthMethod".into(), "CHAP,None".into())));
        assert_eq!(conn.current_stage, LoginStage::Security);
    }

    #[test]
    fn test_single_round_login_commits_session() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let data = text(&[
            ("TargetPortalGroupTag", "1"),
            ("TargetAlias", "disk1"),
            ("MaxBurstLength", "131072"),
            ("FirstBurstLength", "65536"),
            ("MaxRecvDataSegmentLength", "65536"),
            ("HeaderDigest", "None"),
        ]);
        let rsp = response(&conn, 0x0102, 7, 1, 3, true, data);

        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Finished(LoginStatus::Ok));
        assert_eq!(session.tsih, 0x0102);
        assert_eq!(session.params.max_burst_length, 131072);
        assert_eq!(session.target_alias.as_deref(), Some("disk1"));
        assert_eq!(session.portal_group_tag, Some(1));
        assert!(session.is_irrelevant("MaxBurstLength"));
        assert_eq!(conn.exp_statsn, 8);
        assert_eq!(conn.max_xmit_data_segment_len, 65536);
        assert_eq!(conn.current_stage, LoginStage::FullFeature);
    }

    #[test]
    fn test_leading_login_takes_closed_window() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let itt = conn.login_context.as_ref().unwrap().itt;
        let rsp = IscsiPdu::login_response(ISID, 3, 0, 1, 0, 0, 0, 1, 3, true, itt, Vec::new());
        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Finished(LoginStatus::Ok));
        assert_eq!((session.seq.exp_cmdsn, session.seq.max_cmdsn), (1, 0));
        assert!(session.next_cmdsn().is_err());
    }

    #[test]
    fn test_burst_lengths_checked_on_completion() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let data = text(&[("MaxBurstLength", "4096"), ("FirstBurstLength", "8192")]);
        let rsp = response(&conn, 5, 0, 1, 3, true, data);
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::NegotiationFailed)
        );
        assert_eq!(session.tsih, 0);
    }

    #[test]
    fn test_answer_above_offer_fails_negotiation() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let rsp = response(&conn, 5, 0, 1, 3, true, text(&[("MaxBurstLength", "524288")]));
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::NegotiationFailed)
        );
    }

    #[test]
    fn test_unknown_key_answered_not_understood() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let rsp = response(&conn, 0, 0, 1, 3, false, text(&[("FancyKey", "1"), ("X-vendor.k", "v")]));
        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Continue);

        let next = login_req(&mut session, &mut conn).unwrap();
        assert_eq!(
            request_keys(&next),
            vec![("FancyKey".to_string(), "NotUnderstood".to_string())]
        );
    }

    #[test]
    fn test_target_offer_is_answered() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        // Pretend we never proposed it, so the target's value is an offer
        conn.login_context
            .as_mut()
            .unwrap()
            .proposed
            .retain(|(k, _)| k != "MaxConnections");
        let rsp = response(&conn, 0, 0, 1, 3, false, text(&[("MaxConnections", "4")]));
        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Continue);

        let next = login_req(&mut session, &mut conn).unwrap();
        assert_eq!(
            request_keys(&next),
            vec![("MaxConnections".to_string(), "1".to_string())]
        );
        let rsp = response(&conn, 9, 1, 1, 3, true, Vec::new());
        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Finished(LoginStatus::Ok));
        assert_eq!(session.params.max_connections, 1);
    }

    #[test]
    fn test_offer_on_final_response_fails_negotiation() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let rsp = response(&conn, 9, 0, 1, 3, true, text(&[("FancyKey", "1")]));
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::NegotiationFailed)
        );
        assert_eq!(session.tsih, 0);
        assert_ne!(conn.current_stage, LoginStage::FullFeature);
    }

    #[test]
    fn test_vendor_key_on_final_response_is_ignored() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let rsp = response(&conn, 9, 0, 1, 3, true, text(&[("X-vendor.k", "v")]));
        assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Finished(LoginStatus::Ok));
        assert_eq!(session.tsih, 9);
    }

    #[test]
    fn test_wrong_itt_is_invalid() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let mut rsp = response(&conn, 1, 0, 1, 3, true, Vec::new());
        rsp.itt ^= 0xff;
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::InvalidPdu)
        );
        assert_eq!(session.tsih, 0);
        assert_eq!(conn.exp_statsn, 0);
    }

    #[test]
    fn test_transit_and_continue_together_is_invalid() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let mut rsp = response(&conn, 1, 0, 1, 3, true, Vec::new());
        rsp.flags |= flags::CONTINUE_LOGIN;
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::InvalidPdu)
        );
    }

    #[test]
    fn test_nonzero_version_active() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let mut rsp = response(&conn, 1, 0, 1, 3, true, Vec::new());
        rsp.opcode_fields = [2, 2];
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::VersionMismatch)
        );
    }

    #[test]
    fn test_initiator_error_details() {
        for (detail, expected) in [
            (login_status::AUTH_FAILURE, LoginStatus::AuthenticationFailed),
            (login_status::UNSUPPORTED_VERSION, LoginStatus::VersionMismatch),
            (login_status::TARGET_NOT_FOUND, LoginStatus::Failed),
        ] {
            let (mut session, mut conn) = setup(AuthConfig::none());
            login_begin(&mut session, &mut conn).unwrap();
            login_req(&mut session, &mut conn).unwrap();

            let itt = conn.login_context.as_ref().unwrap().itt;
            let rsp = IscsiPdu::login_response(
                ISID,
                0,
                0,
                1,
                1,
                login_status::INITIATOR_ERROR,
                detail,
                1,
                0,
                false,
                itt,
                Vec::new(),
            );
            assert_eq!(login_rsp(&mut session, &mut conn, &rsp), LoginProgress::Finished(expected));
            assert_eq!(conn.login_context.as_ref().unwrap().status_detail, detail);
        }
    }

    #[test]
    fn test_wrong_portal_group() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        session.portal_group_tag = Some(2);
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let rsp = response(&conn, 1, 0, 1, 3, true, text(&[("TargetPortalGroupTag", "3")]));
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::WrongPortalGroup)
        );
    }

    #[test]
    fn test_redirect_without_address_fails() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();

        let itt = conn.login_context.as_ref().unwrap().itt;
        let rsp = IscsiPdu::login_response(
            ISID,
            0,
            0,
            1,
            1,
            login_status::REDIRECTION,
            login_status::TARGET_MOVED_TEMPORARILY,
            1,
            0,
            false,
            itt,
            Vec::new(),
        );
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::RedirectionFailed)
        );
    }

    #[test]
    fn test_partial_response_oversize_fails() {
        let (mut session, mut conn) = setup(AuthConfig::none());
        login_begin(&mut session, &mut conn).unwrap();
        login_req(&mut session, &mut conn).unwrap();
        conn.login_context.as_mut().unwrap().bufsize = 8;

        let mut rsp = response(&conn, 0, 0, 1, 3, false, text(&[("TargetAlias", "a-long-alias")]));
        rsp.flags |= flags::CONTINUE_LOGIN;
        assert_eq!(
            login_rsp(&mut session, &mut conn, &rsp),
            LoginProgress::Finished(LoginStatus::Failed)
        );
    }
}
