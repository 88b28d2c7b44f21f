//! Negotiable login keys (RFC 3720 Section 12)
//!
//! The registry knows, for every key the initiator understands, its default,
//! legal values, how the outcome of a negotiation is computed and whether the
//! key is fixed per session or negotiated per connection. Session-wide keys
//! carry an `IRRELEVANT_*` bit: once the leading connection has fixed them the
//! bit is set in the session bitmap and later connections must not renegotiate.

use crate::error::{IscsiError, IscsiResult};

/// Irrelevant-key bits, one per session-scoped key
pub mod irrelevant {
    pub const MAXCONNECTIONS: u32 = 0x01;
    pub const INITIALR2T: u32 = 0x02;
    pub const IMMEDIATEDATA: u32 = 0x04;
    pub const MAXBURSTLENGTH: u32 = 0x08;
    pub const FIRSTBURSTLENGTH: u32 = 0x10;
    pub const MAXOUTSTANDINGR2T: u32 = 0x20;
    pub const DATAPDUINORDER: u32 = 0x40;
    pub const DATASEQUENCEINORDER: u32 = 0x80;
    pub const DEFAULTTIME2WAIT: u32 = 0x100;
    pub const DEFAULTTIME2RETAIN: u32 = 0x200;
    pub const ERRORRECOVERYLEVEL: u32 = 0x400;
}

/// Reserved answers a target may give instead of a value
pub mod answer {
    pub const IRRELEVANT: &str = "Irrelevant";
    pub const REJECT: &str = "Reject";
    pub const NOT_UNDERSTOOD: &str = "NotUnderstood";
}

/// Whether a key is fixed once per session or negotiated on every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Connection,
}

/// Who may originate a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Initiator,
    Target,
    Both,
}

/// How the negotiated value is derived from the two offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFn {
    /// Numeric, the lower offer wins
    Minimum,
    /// Numeric, the higher offer wins
    Maximum,
    /// Boolean, Yes only if both say Yes
    And,
    /// Boolean, Yes if either says Yes
    Or,
    /// Comma separated list, responder picks the first value it supports
    List,
    /// Not negotiated, each side simply declares its value
    Declarative,
}

/// Legal values of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Values {
    Numeric { min: u32, max: u32 },
    Boolean,
    OneOf(&'static [&'static str]),
    Text,
}

/// Registry entry for one key
#[derive(Debug, Clone, Copy)]
pub struct KeyDef {
    pub name: &'static str,
    pub default: &'static str,
    pub values: Values,
    pub result: ResultFn,
    pub direction: Direction,
    pub scope: Scope,
    /// Sent on discovery sessions too
    pub discovery: bool,
    /// `IRRELEVANT_*` bit, zero for connection-scoped and declarative keys
    pub irrelevant: u32,
}

pub const DIGEST_VALUES: &[&str] = &["None", "CRC32C"];
pub const AUTH_METHODS: &[&str] = &["None", "CHAP", "KRB5", "SPKM1", "SPKM2", "SRP"];
pub const SESSION_TYPES: &[&str] = &["Normal", "Discovery"];

const SEGMENT_MIN: u32 = 512;
const SEGMENT_MAX: u32 = crate::pdu::MAX_DATA_SEGMENT_LENGTH as u32;

/// MaxRecvDataSegmentLength assumed until the peer declares one
pub const DEFAULT_SEGMENT_LENGTH: u32 = 8192;

pub const HEADER_DIGEST: &str = "HeaderDigest";
pub const DATA_DIGEST: &str = "DataDigest";
pub const MAX_CONNECTIONS: &str = "MaxConnections";
pub const INITIAL_R2T: &str = "InitialR2T";
pub const IMMEDIATE_DATA: &str = "ImmediateData";
pub const MAX_RECV_DATA_SEGMENT_LENGTH: &str = "MaxRecvDataSegmentLength";
pub const MAX_BURST_LENGTH: &str = "MaxBurstLength";
pub const FIRST_BURST_LENGTH: &str = "FirstBurstLength";
pub const DEFAULT_TIME2WAIT: &str = "DefaultTime2Wait";
pub const DEFAULT_TIME2RETAIN: &str = "DefaultTime2Retain";
pub const MAX_OUTSTANDING_R2T: &str = "MaxOutstandingR2T";
pub const DATA_PDU_IN_ORDER: &str = "DataPDUInOrder";
pub const DATA_SEQUENCE_IN_ORDER: &str = "DataSequenceInOrder";
pub const ERROR_RECOVERY_LEVEL: &str = "ErrorRecoveryLevel";
pub const IF_MARKER: &str = "IFMarker";
pub const OF_MARKER: &str = "OFMarker";
pub const INITIATOR_NAME: &str = "InitiatorName";
pub const INITIATOR_ALIAS: &str = "InitiatorAlias";
pub const TARGET_NAME: &str = "TargetName";
pub const TARGET_ALIAS: &str = "TargetAlias";
pub const TARGET_ADDRESS: &str = "TargetAddress";
pub const TARGET_PORTAL_GROUP_TAG: &str = "TargetPortalGroupTag";
pub const SESSION_TYPE: &str = "SessionType";
pub const AUTH_METHOD: &str = "AuthMethod";

#[allow(clippy::too_many_arguments)]
const fn key(
    name: &'static str,
    default: &'static str,
    values: Values,
    result: ResultFn,
    direction: Direction,
    scope: Scope,
    discovery: bool,
    irrelevant: u32,
) -> KeyDef {
    KeyDef {
        name,
        default,
        values,
        result,
        direction,
        scope,
        discovery,
        irrelevant,
    }
}

use Direction::{Both, Initiator, Target};
use ResultFn::{And, Declarative, List, Maximum, Minimum, Or};
use Scope::{Connection, Session};

/// Every key the initiator knows, in the order it proposes them
pub static KEYS: &[KeyDef] = &[
    key(HEADER_DIGEST, "None", Values::OneOf(DIGEST_VALUES), List, Both, Connection, true, 0),
    key(DATA_DIGEST, "None", Values::OneOf(DIGEST_VALUES), List, Both, Connection, true, 0),
    key(
        MAX_RECV_DATA_SEGMENT_LENGTH,
        "8192",
        Values::Numeric { min: SEGMENT_MIN, max: SEGMENT_MAX },
        Declarative,
        Both,
        Connection,
        true,
        0,
    ),
    key(
        MAX_CONNECTIONS,
        "1",
        Values::Numeric { min: 1, max: 65535 },
        Minimum,
        Both,
        Session,
        false,
        irrelevant::MAXCONNECTIONS,
    ),
    key(INITIAL_R2T, "Yes", Values::Boolean, Or, Both, Session, false, irrelevant::INITIALR2T),
    key(
        IMMEDIATE_DATA,
        "Yes",
        Values::Boolean,
        And,
        Both,
        Session,
        false,
        irrelevant::IMMEDIATEDATA,
    ),
    key(
        MAX_BURST_LENGTH,
        "262144",
        Values::Numeric { min: SEGMENT_MIN, max: SEGMENT_MAX },
        Minimum,
        Both,
        Session,
        false,
        irrelevant::MAXBURSTLENGTH,
    ),
    key(
        FIRST_BURST_LENGTH,
        "65536",
        Values::Numeric { min: SEGMENT_MIN, max: SEGMENT_MAX },
        Minimum,
        Both,
        Session,
        false,
        irrelevant::FIRSTBURSTLENGTH,
    ),
    key(
        DEFAULT_TIME2WAIT,
        "2",
        Values::Numeric { min: 0, max: 3600 },
        Maximum,
        Both,
        Session,
        true,
        irrelevant::DEFAULTTIME2WAIT,
    ),
    key(
        DEFAULT_TIME2RETAIN,
        "20",
        Values::Numeric { min: 0, max: 3600 },
        Minimum,
        Both,
        Session,
        true,
        irrelevant::DEFAULTTIME2RETAIN,
    ),
    key(
        MAX_OUTSTANDING_R2T,
        "1",
        Values::Numeric { min: 1, max: 65535 },
        Minimum,
        Both,
        Session,
        false,
        irrelevant::MAXOUTSTANDINGR2T,
    ),
    key(
        DATA_PDU_IN_ORDER,
        "Yes",
        Values::Boolean,
        Or,
        Both,
        Session,
        false,
        irrelevant::DATAPDUINORDER,
    ),
    key(
        DATA_SEQUENCE_IN_ORDER,
        "Yes",
        Values::Boolean,
        Or,
        Both,
        Session,
        false,
        irrelevant::DATASEQUENCEINORDER,
    ),
    key(
        ERROR_RECOVERY_LEVEL,
        "0",
        Values::Numeric { min: 0, max: 2 },
        Minimum,
        Both,
        Session,
        true,
        irrelevant::ERRORRECOVERYLEVEL,
    ),
    key(IF_MARKER, "No", Values::Boolean, And, Both, Connection, false, 0),
    key(OF_MARKER, "No", Values::Boolean, And, Both, Connection, false, 0),
    key(INITIATOR_NAME, "", Values::Text, Declarative, Initiator, Session, true, 0),
    key(INITIATOR_ALIAS, "", Values::Text, Declarative, Initiator, Session, true, 0),
    key(TARGET_NAME, "", Values::Text, Declarative, Initiator, Session, false, 0),
    key(TARGET_ALIAS, "", Values::Text, Declarative, Target, Session, false, 0),
    key(TARGET_ADDRESS, "", Values::Text, Declarative, Target, Session, true, 0),
    key(
        TARGET_PORTAL_GROUP_TAG,
        "",
        Values::Numeric { min: 0, max: 65535 },
        Declarative,
        Target,
        Session,
        true,
        0,
    ),
    key(
        SESSION_TYPE,
        "Normal",
        Values::OneOf(SESSION_TYPES),
        Declarative,
        Initiator,
        Session,
        true,
        0,
    ),
    key(AUTH_METHOD, "None", Values::OneOf(AUTH_METHODS), List, Both, Connection, true, 0),
];

/// Find a key definition by name
pub fn lookup(name: &str) -> Option<&'static KeyDef> {
    KEYS.iter().find(|k| k.name == name)
}

/// Vendor-specific keys are ignored rather than rejected
pub fn is_vendor_specific(name: &str) -> bool {
    name.starts_with("X-") || name.starts_with("X#")
}

/// Parse an iSCSI numeric value (decimal or `0x` hex)
pub fn parse_number(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u32>().ok()
    }
}

/// Parse an iSCSI boolean value
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "Yes" => Some(true),
        "No" => Some(false),
        _ => None,
    }
}

pub fn yes_no(v: bool) -> &'static str {
    if v {
        "Yes"
    } else {
        "No"
    }
}

impl KeyDef {
    /// Check a single value against the legal values of this key
    pub fn validate(&self, value: &str) -> IscsiResult<()> {
        let ok = match self.values {
            Values::Numeric { min, max } => {
                matches!(parse_number(value), Some(v) if v >= min && v <= max)
            }
            Values::Boolean => parse_bool(value).is_some(),
            Values::OneOf(allowed) => value.split(',').all(|v| allowed.contains(&v)),
            Values::Text => !value.is_empty(),
        };

        if ok {
            Ok(())
        } else {
            Err(IscsiError::Negotiation(format!(
                "illegal value {}={}",
                self.name, value
            )))
        }
    }

    /// Check the target's answer to a value we proposed
    pub fn check_answer(&self, proposed: &str, answered: &str) -> IscsiResult<()> {
        self.validate(answered)?;

        let ok = match self.result {
            ResultFn::Minimum => match (parse_number(proposed), parse_number(answered)) {
                (Some(p), Some(a)) => a <= p,
                _ => false,
            },
            ResultFn::Maximum => match (parse_number(proposed), parse_number(answered)) {
                (Some(p), Some(a)) => a >= p,
                _ => false,
            },
            ResultFn::And => proposed == "Yes" || answered == "No",
            ResultFn::Or => proposed == "No" || answered == "Yes",
            ResultFn::List => {
                !answered.contains(',') && proposed.split(',').any(|v| v == answered)
            }
            ResultFn::Declarative => true,
        };

        if ok {
            Ok(())
        } else {
            Err(IscsiError::Negotiation(format!(
                "target answered {}={} to our offer {}",
                self.name, answered, proposed
            )))
        }
    }

    /// Compute our answer to a value the target offered first
    ///
    /// Returns `None` when no acceptable value exists and the key must be
    /// answered with `Reject`.
    pub fn resolve(&self, ours: &str, theirs: &str) -> Option<String> {
        match self.result {
            ResultFn::Minimum => Some(parse_number(ours)?.min(parse_number(theirs)?).to_string()),
            ResultFn::Maximum => Some(parse_number(ours)?.max(parse_number(theirs)?).to_string()),
            ResultFn::And => {
                Some(yes_no(parse_bool(ours)? && parse_bool(theirs)?).to_string())
            }
            ResultFn::Or => Some(yes_no(parse_bool(ours)? || parse_bool(theirs)?).to_string()),
            ResultFn::List => theirs
                .split(',')
                .find(|t| ours.split(',').any(|o| o == *t))
                .map(str::to_string),
            ResultFn::Declarative => Some(ours.to_string()),
        }
    }
}

/// Bitmap of session-scoped keys that are already fixed for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrrelevantKeys(u32);

impl IrrelevantKeys {
    pub fn new() -> Self {
        IrrelevantKeys(0)
    }

    /// All bits of session-scoped keys
    pub fn session_scoped() -> Self {
        IrrelevantKeys(KEYS.iter().fold(0, |acc, k| acc | k.irrelevant))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn mark(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn is_set(&self, bit: u32) -> bool {
        bit != 0 && (self.0 & bit) == bit
    }

    /// True when `key` is a session-scoped key already fixed for this session
    pub fn is_irrelevant(&self, key: &str) -> bool {
        lookup(key).map(|k| self.is_set(k.irrelevant)).unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Digest offer configured for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestPreference {
    #[default]
    None,
    Crc32c,
    /// Offer both, prefer CRC32C
    Crc32cNone,
    /// Offer both, prefer None
    NoneCrc32c,
}

impl DigestPreference {
    /// Value list sent in HeaderDigest/DataDigest
    pub fn offer(&self) -> &'static str {
        match self {
            DigestPreference::None => "None",
            DigestPreference::Crc32c => "CRC32C",
            DigestPreference::Crc32cNone => "CRC32C,None",
            DigestPreference::NoneCrc32c => "None,CRC32C",
        }
    }
}

/// Digest in effect after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

impl DigestType {
    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "None" => Some(DigestType::None),
            "CRC32C" => Some(DigestType::CRC32C),
            _ => None,
        }
    }

    pub fn enabled(&self) -> bool {
        *self == DigestType::CRC32C
    }
}
