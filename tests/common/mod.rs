//! Shared fixtures for the login scenario tests
//!
//! [`ScriptedTarget`] stands in for a target portal: every Login Request the
//! initiator sends is logged and handed to the next step of a script, whose
//! return value (if any) is queued as the response.

#![allow(dead_code)]

use iscsi_initiator::config::NodeRecord;
use iscsi_initiator::error::{IscsiError, IscsiResult};
use iscsi_initiator::pdu::{opcode, serialize_text_parameters, IscsiPdu, LoginRequest};
use iscsi_initiator::transport::{Portal, Readiness, Transport};
use iscsi_initiator::{AuthConfig, ChapCredentials};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

// ============================================================================
// Fixture
// ============================================================================

#[derive(Debug)]
pub struct Fixture {
    pub initiator_iqn: String,
    pub initiator_alias: String,
    pub target_iqn: String,
    pub target_alias: String,
    pub portal: String,
    pub redirect: String,
    pub tsih: u16,
    pub chap_user: String,
    pub chap_secret: String,
    pub target_user: String,
    pub target_secret: String,
}

pub static FIXTURE: Lazy<Fixture> = Lazy::new(|| {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/login.toml");
    let contents = std::fs::read_to_string(path).expect("Failed to read tests/fixtures/login.toml");

    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse tests/fixtures/login.toml - invalid TOML syntax");

    let string = |section: &str, key: &str| -> String {
        config
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [{}] section", key, section))
            .to_string()
    };
    let target_chap = |key: &str| -> String {
        config
            .get("chap")
            .and_then(|c| c.get("target"))
            .and_then(|t| t.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [chap.target] section", key))
            .to_string()
    };

    let tsih = config
        .get("target")
        .and_then(|t| t.get("tsih"))
        .and_then(|v| v.as_integer())
        .expect("Missing or invalid 'tsih' in [target] section") as u16;

    Fixture {
        initiator_iqn: string("initiator", "iqn"),
        initiator_alias: string("initiator", "alias"),
        target_iqn: string("target", "iqn"),
        target_alias: string("target", "alias"),
        portal: string("target", "portal"),
        redirect: string("target", "redirect"),
        tsih,
        chap_user: string("chap", "username"),
        chap_secret: string("chap", "secret"),
        target_user: target_chap("username"),
        target_secret: target_chap("secret"),
    }
});

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn node_record(auth: AuthConfig) -> NodeRecord {
    NodeRecord::builder()
        .initiator_name(&FIXTURE.initiator_iqn)
        .target_name(&FIXTURE.target_iqn)
        .portal(&FIXTURE.portal)
        .auth(auth)
        .build()
        .expect("fixture node record")
}

pub fn chap() -> AuthConfig {
    AuthConfig::chap(ChapCredentials::new(&FIXTURE.chap_user, &FIXTURE.chap_secret))
}

pub fn mutual_chap() -> AuthConfig {
    AuthConfig::mutual_chap(
        ChapCredentials::new(&FIXTURE.chap_user, &FIXTURE.chap_secret),
        ChapCredentials::new(&FIXTURE.target_user, &FIXTURE.target_secret),
    )
}

// ============================================================================
// Scripted target
// ============================================================================

/// What the target saw, shared with the test body
#[derive(Debug, Default)]
pub struct TargetLog {
    pub connects: Vec<Portal>,
    pub requests: Vec<LoginRequest>,
    pub logouts: usize,
}

pub type SharedLog = Rc<RefCell<TargetLog>>;

pub type Step = Box<dyn FnMut(&LoginRequest) -> Option<IscsiPdu>>;

pub struct ScriptedTarget {
    log: SharedLog,
    steps: VecDeque<Step>,
    inbox: VecDeque<IscsiPdu>,
    connected: bool,
}

impl fmt::Debug for ScriptedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTarget")
            .field("steps", &self.steps.len())
            .field("inbox", &self.inbox.len())
            .field("connected", &self.connected)
            .finish()
    }
}

impl ScriptedTarget {
    pub fn new(log: &SharedLog) -> Self {
        ScriptedTarget {
            log: Rc::clone(log),
            steps: VecDeque::new(),
            inbox: VecDeque::new(),
            connected: false,
        }
    }

    /// Answer the next request with whatever `f` returns
    pub fn reply(mut self, mut f: impl FnMut(&LoginRequest) -> IscsiPdu + 'static) -> Self {
        self.steps.push_back(Box::new(move |req| Some(f(req))));
        self
    }

    /// Swallow the next request without answering
    pub fn silent(mut self) -> Self {
        self.steps.push_back(Box::new(|_| None));
        self
    }

    pub fn boxed(self) -> Box<dyn Transport> {
        Box::new(self)
    }
}

fn not_connected() -> IscsiError {
    IscsiError::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected"))
}

impl Transport for ScriptedTarget {
    fn connect(&mut self, portal: &Portal, _non_blocking: bool) -> IscsiResult<()> {
        self.log.borrow_mut().connects.push(portal.clone());
        self.inbox.clear();
        self.connected = true;
        Ok(())
    }

    fn poll(&mut self) -> IscsiResult<Readiness> {
        if !self.connected {
            return Err(not_connected());
        }
        Ok(if self.inbox.is_empty() {
            Readiness::Connected
        } else {
            Readiness::Readable
        })
    }

    fn send_pdu(
        &mut self,
        pdu: &IscsiPdu,
        _header_digest: bool,
        _data_digest: bool,
        _timeout: Duration,
    ) -> IscsiResult<()> {
        if !self.connected {
            return Err(not_connected());
        }
        if pdu.opcode == opcode::LOGOUT_REQUEST {
            self.log.borrow_mut().logouts += 1;
            let s = &pdu.specific;
            let cmd_sn = u32::from_be_bytes([s[4], s[5], s[6], s[7]]);
            let exp_stat_sn = u32::from_be_bytes([s[8], s[9], s[10], s[11]]);
            self.inbox.push_back(IscsiPdu::logout_response(
                pdu.itt,
                exp_stat_sn,
                cmd_sn,
                cmd_sn.wrapping_add(16),
                0,
                2,
                20,
            ));
            return Ok(());
        }
        let req = pdu.parse_login_request()?;
        self.log.borrow_mut().requests.push(req.clone());

        let Some(mut step) = self.steps.pop_front() else {
            self.connected = false;
            return Err(IscsiError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "target closed the connection",
            )));
        };
        if let Some(rsp) = step(&req) {
            self.inbox.push_back(rsp);
        }
        Ok(())
    }

    fn recv_pdu(
        &mut self,
        _header_digest: bool,
        _data_digest: bool,
        _max_data_length: usize,
        _timeout: Duration,
    ) -> IscsiResult<IscsiPdu> {
        self.inbox
            .pop_front()
            .ok_or_else(|| IscsiError::Timeout("no Login Response".to_string()))
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.inbox.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Response builders
// ============================================================================

pub fn text(keys: &[(&str, &str)]) -> Vec<u8> {
    let owned: Vec<(String, String)> = keys
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    serialize_text_parameters(&owned)
}

/// Successful Login Response to `req`
///
/// StatSN follows the request's ExpStatSN, so a target built from these
/// never breaks the initiator's StatSN expectation.
pub fn respond(req: &LoginRequest, tsih: u16, transit: bool, nsg: u8, keys: &[(&str, &str)]) -> IscsiPdu {
    IscsiPdu::login_response(
        req.isid,
        tsih,
        req.exp_stat_sn,
        req.cmd_sn,
        req.cmd_sn.wrapping_add(16),
        0,
        0,
        req.csg,
        nsg,
        transit,
        req.itt,
        text(keys),
    )
}

/// Failed Login Response with the given status
pub fn reject(req: &LoginRequest, class: u8, detail: u8, keys: &[(&str, &str)]) -> IscsiPdu {
    IscsiPdu::login_response(
        req.isid,
        0,
        req.exp_stat_sn,
        req.cmd_sn,
        req.cmd_sn.wrapping_add(16),
        class,
        detail,
        req.csg,
        req.nsg,
        false,
        req.itt,
        text(keys),
    )
}

/// Value the initiator sent for `key`
pub fn key<'a>(req: &'a LoginRequest, key: &str) -> Option<&'a str> {
    req.parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Echo the operational proposal back, the way a permissive target would
pub fn echo_operational(req: &LoginRequest) -> Vec<(String, String)> {
    req.parameters
        .iter()
        .filter(|(k, _)| k != "InitiatorName" && k != "InitiatorAlias" && k != "SessionType" && k != "TargetName")
        .map(|(k, v)| match v.split_once(',') {
            Some((first, _)) => (k.clone(), first.to_string()),
            None => (k.clone(), v.clone()),
        })
        .collect()
}

/// Final operational-stage response accepting every proposal
pub fn accept_operational(req: &LoginRequest, tsih: u16, extra: &[(&str, &str)]) -> IscsiPdu {
    let mut keys = echo_operational(req);
    keys.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    let borrowed: Vec<(&str, &str)> = keys.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    respond(req, tsih, true, 3, &borrowed)
}
