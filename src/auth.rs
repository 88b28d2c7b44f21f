//! Login authentication (RFC 3720 Section 8.2, 11.1)
//!
//! The login state machine does not compute digests itself. It hands the
//! security keys the target sent to an [`AuthClient`] as a [`CredentialBlock`]
//! and acts on the pass/fail/continue verdict. [`ChapClient`] is the bundled
//! CHAP implementation, one-way or mutual.

use crate::error::{IscsiError, IscsiResult};
use rand::Rng;

/// CHAP algorithm identifier (RFC 1994)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapAlgorithm {
    /// MD5 algorithm (algorithm identifier 5)
    Md5 = 5,
}

impl ChapAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "5" => Some(ChapAlgorithm::Md5),
            _ => None,
        }
    }
}

/// Authentication methods the initiator can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Chap,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "None",
            AuthMethod::Chap => "CHAP",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "None" => Some(AuthMethod::None),
            "CHAP" => Some(AuthMethod::Chap),
            _ => None,
        }
    }
}

/// Outcome of one authentication round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    /// More rounds needed
    Continue,
    /// Authentication complete on the initiator side
    Pass,
    /// Credentials rejected
    Fail,
}

/// CHAP credentials for authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    /// Username for CHAP authentication
    pub username: String,
    /// Secret/password for CHAP authentication
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Authentication configuration of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Credentials the initiator presents to the target
    pub credentials: Option<ChapCredentials>,
    /// Credentials the target must present back (mutual CHAP)
    pub target_credentials: Option<ChapCredentials>,
    /// Offer `None` alongside CHAP
    pub allow_none: bool,
}

impl AuthConfig {
    /// No authentication
    pub fn none() -> Self {
        AuthConfig::default()
    }

    /// One-way CHAP: initiator authenticates to target
    pub fn chap(credentials: ChapCredentials) -> Self {
        AuthConfig {
            credentials: Some(credentials),
            target_credentials: None,
            allow_none: false,
        }
    }

    /// Mutual CHAP: both sides authenticate
    pub fn mutual_chap(
        initiator_credentials: ChapCredentials,
        target_credentials: ChapCredentials,
    ) -> Self {
        AuthConfig {
            credentials: Some(initiator_credentials),
            target_credentials: Some(target_credentials),
            allow_none: false,
        }
    }

    /// Also offer `None`, letting the target skip authentication
    pub fn allow_none(mut self) -> Self {
        self.allow_none = true;
        self
    }

    /// Check if an authentication method other than None is configured
    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    /// Check if mutual CHAP is required
    pub fn is_mutual(&self) -> bool {
        self.target_credentials.is_some()
    }

    /// Methods offered in AuthMethod, most preferred first
    pub fn offered_methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        if self.requires_auth() {
            methods.push(AuthMethod::Chap);
        }
        if !self.requires_auth() || (self.allow_none && !self.is_mutual()) {
            methods.push(AuthMethod::None);
        }
        methods
    }

    /// Build a fresh client for one login attempt
    pub fn client(&self) -> Option<Box<dyn AuthClient>> {
        let credentials = self.credentials.clone()?;
        Some(Box::new(ChapClient::new(
            credentials,
            self.target_credentials.clone(),
            self.allow_none && !self.is_mutual(),
        )))
    }
}

/// Security keys exchanged in one login round
///
/// Text values land in the string sub-block; `0x` encoded binary values
/// (challenges, responses) are decoded into the large-binary sub-block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialBlock {
    pub strings: Vec<(String, String)>,
    pub binary: Vec<(String, Vec<u8>)>,
}

impl CredentialBlock {
    pub fn new() -> Self {
        CredentialBlock::default()
    }

    /// Sort received keys into the two sub-blocks
    pub fn from_keys(keys: &[(String, String)]) -> IscsiResult<Self> {
        let mut block = CredentialBlock::new();
        for (key, value) in keys {
            if is_binary_value(value) {
                block.push_binary(key, decode_binary_value(value)?);
            } else {
                block.push_string(key, value);
            }
        }
        Ok(block)
    }

    /// Encode both sub-blocks as text keys
    pub fn to_keys(&self) -> Vec<(String, String)> {
        let mut keys = self.strings.clone();
        keys.extend(
            self.binary
                .iter()
                .map(|(k, v)| (k.clone(), encode_binary_value(v))),
        );
        keys
    }

    pub fn push_string(&mut self, key: &str, value: &str) {
        self.strings.push((key.to_string(), value.to_string()));
    }

    pub fn push_binary(&mut self, key: &str, value: Vec<u8>) {
        self.binary.push((key.to_string(), value));
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.strings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn binary(&self, key: &str) -> Option<&[u8]> {
        self.binary
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.binary.is_empty()
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.binary.clear();
    }
}

/// Authentication capability driven by the login state machine
pub trait AuthClient: std::fmt::Debug {
    /// Methods to offer, most preferred first
    fn methods(&self) -> Vec<AuthMethod>;

    /// True once the initiator may request a transit out of the Security stage
    fn transit_ready(&self) -> bool;

    /// Consume the target's keys for `method` and fill in the keys to send next
    fn step(
        &mut self,
        method: AuthMethod,
        recv: &CredentialBlock,
        send: &mut CredentialBlock,
    ) -> AuthVerdict;
}

/// CHAP challenge state
#[derive(Debug, Clone)]
pub struct ChapAuthState {
    /// CHAP identifier (random byte)
    pub identifier: u8,
    /// CHAP challenge (random bytes)
    pub challenge: Vec<u8>,
    /// Whether this challenge is for the target authenticating to us
    pub is_target_auth: bool,
}

impl ChapAuthState {
    /// Generate a new CHAP challenge
    pub fn new(is_target_auth: bool) -> Self {
        let mut rng = rand::thread_rng();

        let identifier = rng.gen::<u8>();

        let mut challenge = vec![0u8; 16];
        rng.fill(&mut challenge[..]);

        Self {
            identifier,
            challenge,
            is_target_auth,
        }
    }

    /// Expected response: MD5(identifier + secret + challenge)
    pub fn calculate_response(&self, secret: &str) -> Vec<u8> {
        chap_response(self.identifier, secret, &self.challenge)
    }

    /// Validate a CHAP response
    pub fn validate_response(&self, response: &[u8], secret: &str) -> bool {
        let expected = self.calculate_response(secret);

        // Constant-time comparison to prevent timing attacks
        if response.len() != expected.len() {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in response.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }

        diff == 0
    }

    /// Convert identifier to string
    pub fn identifier_str(&self) -> String {
        self.identifier.to_string()
    }
}

/// CHAP response = MD5(identifier + secret + challenge)
pub fn chap_response(identifier: u8, secret: &str, challenge: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + secret.len() + challenge.len());
    data.push(identifier);
    data.extend_from_slice(secret.as_bytes());
    data.extend_from_slice(challenge);

    md5::compute(&data).0.to_vec()
}

/// True for RFC 3720 binary values (`0x` hex or `0b` base64)
pub fn is_binary_value(value: &str) -> bool {
    let lower = value.get(..2).map(|p| p.to_ascii_lowercase());
    matches!(lower.as_deref(), Some("0x") | Some("0b"))
}

/// Decode a hex-encoded binary value
pub fn decode_binary_value(value: &str) -> IscsiResult<Vec<u8>> {
    match value.get(..2) {
        Some("0x") | Some("0X") => hex::decode(&value[2..])
            .map_err(|e| IscsiError::Auth(format!("Invalid CHAP hex value: {}", e))),
        _ => Err(IscsiError::Auth(format!(
            "Unsupported binary encoding: {}",
            value
        ))),
    }
}

/// Encode a binary value as `0x` hex
pub fn encode_binary_value(value: &[u8]) -> String {
    format!("0x{}", hex::encode(value))
}

pub const CHAP_A: &str = "CHAP_A";
pub const CHAP_I: &str = "CHAP_I";
pub const CHAP_C: &str = "CHAP_C";
pub const CHAP_N: &str = "CHAP_N";
pub const CHAP_R: &str = "CHAP_R";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChapPhase {
    Start,
    AwaitChallenge,
    AwaitTargetResponse,
    Done,
}

/// Initiator side of CHAP
#[derive(Debug)]
pub struct ChapClient {
    credentials: ChapCredentials,
    target_credentials: Option<ChapCredentials>,
    allow_none: bool,
    phase: ChapPhase,
    challenge: Option<ChapAuthState>,
}

impl ChapClient {
    pub fn new(
        credentials: ChapCredentials,
        target_credentials: Option<ChapCredentials>,
        allow_none: bool,
    ) -> Self {
        Self {
            credentials,
            target_credentials,
            allow_none,
            phase: ChapPhase::Start,
            challenge: None,
        }
    }

    fn answer_challenge(&mut self, recv: &CredentialBlock, send: &mut CredentialBlock) -> AuthVerdict {
        if recv.string(CHAP_A).and_then(ChapAlgorithm::from_str) != Some(ChapAlgorithm::Md5) {
            log::warn!("CHAP: target did not select algorithm 5 (MD5)");
            return AuthVerdict::Fail;
        }
        let identifier = match recv.string(CHAP_I).and_then(|v| v.parse::<u8>().ok()) {
            Some(id) => id,
            None => {
                log::warn!("CHAP: missing or invalid CHAP_I");
                return AuthVerdict::Fail;
            }
        };
        let challenge = match recv.binary(CHAP_C) {
            Some(c) if !c.is_empty() => c,
            _ => {
                log::warn!("CHAP: missing or empty CHAP_C");
                return AuthVerdict::Fail;
            }
        };

        send.push_string(CHAP_N, &self.credentials.username);
        send.push_binary(
            CHAP_R,
            chap_response(identifier, &self.credentials.secret, challenge),
        );

        if self.target_credentials.is_none() {
            self.phase = ChapPhase::Done;
            return AuthVerdict::Pass;
        }

        // Never reflect the target's own challenge back at it
        let mut ours = ChapAuthState::new(true);
        while ours.challenge.as_slice() == challenge {
            ours = ChapAuthState::new(true);
        }
        send.push_string(CHAP_I, &ours.identifier_str());
        send.push_binary(CHAP_C, ours.challenge.clone());
        self.challenge = Some(ours);
        self.phase = ChapPhase::AwaitTargetResponse;
        AuthVerdict::Continue
    }

    fn verify_target(&mut self, recv: &CredentialBlock) -> AuthVerdict {
        let (Some(expected), Some(challenge)) = (&self.target_credentials, &self.challenge) else {
            return AuthVerdict::Fail;
        };

        if recv.string(CHAP_N) != Some(expected.username.as_str()) {
            log::warn!("CHAP: target name {:?} not accepted", recv.string(CHAP_N));
            return AuthVerdict::Fail;
        }
        match recv.binary(CHAP_R) {
            Some(response) if challenge.validate_response(response, &expected.secret) => {
                self.phase = ChapPhase::Done;
                AuthVerdict::Pass
            }
            _ => {
                log::warn!("CHAP: target response failed verification");
                AuthVerdict::Fail
            }
        }
    }
}

impl AuthClient for ChapClient {
    fn methods(&self) -> Vec<AuthMethod> {
        if self.allow_none {
            vec![AuthMethod::Chap, AuthMethod::None]
        } else {
            vec![AuthMethod::Chap]
        }
    }

    fn transit_ready(&self) -> bool {
        matches!(
            self.phase,
            ChapPhase::AwaitTargetResponse | ChapPhase::Done
        )
    }

    fn step(
        &mut self,
        method: AuthMethod,
        recv: &CredentialBlock,
        send: &mut CredentialBlock,
    ) -> AuthVerdict {
        match method {
            AuthMethod::None if self.allow_none => {
                self.phase = ChapPhase::Done;
                AuthVerdict::Pass
            }
            AuthMethod::None => AuthVerdict::Fail,
            AuthMethod::Chap => match self.phase {
                ChapPhase::Start => {
                    send.push_string(CHAP_A, "5");
                    self.phase = ChapPhase::AwaitChallenge;
                    AuthVerdict::Continue
                }
                ChapPhase::AwaitChallenge => self.answer_challenge(recv, send),
                ChapPhase::AwaitTargetResponse => self.verify_target(recv),
                ChapPhase::Done => AuthVerdict::Pass,
            },
        }
    }
}
