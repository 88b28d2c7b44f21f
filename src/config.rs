//! Node records and persisted initiator identity
//!
//! A [`NodeRecord`] is everything needed to log into one target through one
//! portal: names, portal, session type, authentication and the values we
//! offer during operational negotiation. Records are built with
//! [`NodeRecord::builder`], which validates them against the parameter
//! registry before a session ever sees them.

use crate::auth::AuthConfig;
use crate::connection::Timeouts;
use crate::error::{IscsiError, IscsiResult};
use crate::params::{self, DigestPreference, Scope};
use crate::provider::ProviderType;
use crate::session::{RetryPolicy, SessionParams, SessionType};
use crate::transport::Portal;
use std::path::Path;

pub const CONFIG_FILE: &str = "/etc/iscsi/iscsid.conf";
pub const PID_FILE: &str = "/var/run/iscsid.pid";
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
pub const DISCOVERY_FILE: &str = "/var/db/iscsi/discovery";
pub const NODE_FILE: &str = "/var/db/iscsi/node";

/// Longest iSCSI name allowed (RFC 3720 Section 3.2.6.1)
pub const ISCSI_NAME_MAXLEN: usize = 223;

/// RFC 3720 recommends CHAP secrets of at least 96 bits
const CHAP_SECRET_MIN_LEN: usize = 12;

/// Default ISID: OUI format with the open-iscsi OUI and qualifier 0
pub const DEFAULT_ISID: [u8; 6] = [0x00, 0x02, 0x3D, 0x00, 0x00, 0x00];

/// Check an iSCSI name in `iqn.`, `eui.` or `naa.` format
pub fn validate_iscsi_name(name: &str) -> IscsiResult<()> {
    let bad = |why: &str| IscsiError::Config(format!("invalid iSCSI name {:?}: {}", name, why));

    if name.is_empty() || name.len() > ISCSI_NAME_MAXLEN {
        return Err(bad("length must be 1..=223"));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(bad("contains whitespace"));
    }

    if let Some(rest) = name.strip_prefix("iqn.") {
        // iqn.YYYY-MM.reversed.domain[:identifier]
        let bytes = rest.as_bytes();
        let dated = bytes.len() > 8
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[4] == b'-'
            && bytes[5..7].iter().all(u8::is_ascii_digit)
            && bytes[7] == b'.';
        if !dated {
            return Err(bad("expected iqn.yyyy-mm.naming-authority"));
        }
        Ok(())
    } else if let Some(hex) = name.strip_prefix("eui.") {
        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad("eui. names carry 16 hex digits"));
        }
        Ok(())
    } else if let Some(hex) = name.strip_prefix("naa.") {
        if !(hex.len() == 16 || hex.len() == 32) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad("naa. names carry 16 or 32 hex digits"));
        }
        Ok(())
    } else {
        Err(bad("must start with iqn., eui. or naa."))
    }
}

/// Everything needed to log into one target through one portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub initiator_name: String,
    pub initiator_alias: Option<String>,
    /// Empty for discovery sessions
    pub target_name: String,
    pub portal: Portal,
    /// Expected TargetPortalGroupTag, if known
    pub portal_group_tag: Option<u16>,
    pub session_type: SessionType,
    pub isid: [u8; 6],
    pub auth: AuthConfig,
    /// Session-wide values offered on the leading login
    pub session: SessionParams,
    pub header_digest: DigestPreference,
    pub data_digest: DigestPreference,
    /// MaxRecvDataSegmentLength we declare
    pub max_recv_data_segment_len: u32,
    pub timeouts: Timeouts,
    pub tcp_window_size: Option<usize>,
    pub type_of_service: Option<u32>,
    pub provider: ProviderType,
    pub retry: RetryPolicy,
}

impl NodeRecord {
    /// Create a new builder for a node record
    pub fn builder() -> NodeRecordBuilder {
        NodeRecordBuilder::new()
    }
}

/// Builder for [`NodeRecord`]
#[derive(Debug, Clone, Default)]
pub struct NodeRecordBuilder {
    initiator_name: Option<String>,
    initiator_alias: Option<String>,
    target_name: Option<String>,
    portal: Option<String>,
    portal_group_tag: Option<u16>,
    session_type: SessionType,
    isid: Option<[u8; 6]>,
    auth: AuthConfig,
    session: SessionParams,
    header_digest: DigestPreference,
    data_digest: DigestPreference,
    max_recv_data_segment_len: Option<u32>,
    timeouts: Timeouts,
    tcp_window_size: Option<usize>,
    type_of_service: Option<u32>,
    provider: ProviderType,
    retry: RetryPolicy,
}

impl NodeRecordBuilder {
    fn new() -> Self {
        NodeRecordBuilder::default()
    }

    /// Set the initiator name (IQN/EUI/NAA format)
    pub fn initiator_name(mut self, name: &str) -> Self {
        self.initiator_name = Some(name.to_string());
        self
    }

    pub fn initiator_alias(mut self, alias: &str) -> Self {
        self.initiator_alias = Some(alias.to_string());
        self
    }

    /// Set the target name. Required for normal sessions.
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    /// Set the portal as `host[:port]` (default port 3260)
    pub fn portal(mut self, portal: &str) -> Self {
        self.portal = Some(portal.to_string());
        self
    }

    pub fn portal_group_tag(mut self, tag: u16) -> Self {
        self.portal_group_tag = Some(tag);
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    pub fn isid(mut self, isid: [u8; 6]) -> Self {
        self.isid = Some(isid);
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Session-wide values to offer
    pub fn session_params(mut self, params: SessionParams) -> Self {
        self.session = params;
        self
    }

    pub fn header_digest(mut self, digest: DigestPreference) -> Self {
        self.header_digest = digest;
        self
    }

    pub fn data_digest(mut self, digest: DigestPreference) -> Self {
        self.data_digest = digest;
        self
    }

    pub fn max_recv_data_segment_len(mut self, len: u32) -> Self {
        self.max_recv_data_segment_len = Some(len);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tcp_window_size(mut self, size: usize) -> Self {
        self.tcp_window_size = Some(size);
        self
    }

    pub fn type_of_service(mut self, tos: u32) -> Self {
        self.type_of_service = Some(tos);
        self
    }

    pub fn provider(mut self, provider: ProviderType) -> Self {
        self.provider = provider;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate and build the record
    pub fn build(self) -> IscsiResult<NodeRecord> {
        let initiator_name = self
            .initiator_name
            .ok_or_else(|| IscsiError::Config("initiator_name is required".to_string()))?;
        validate_iscsi_name(&initiator_name)?;

        let target_name = self.target_name.unwrap_or_default();
        match self.session_type {
            SessionType::Normal => validate_iscsi_name(&target_name)?,
            SessionType::Discovery if !target_name.is_empty() => {
                return Err(IscsiError::Config(
                    "discovery sessions do not name a target".to_string(),
                ))
            }
            SessionType::Discovery => {}
        }

        let portal = Portal::parse(
            self.portal
                .as_deref()
                .ok_or_else(|| IscsiError::Config("portal is required".to_string()))?,
        )?;

        if self.auth.target_credentials.is_some() && self.auth.credentials.is_none() {
            return Err(IscsiError::Config(
                "mutual CHAP needs initiator credentials as well".to_string(),
            ));
        }
        for creds in [&self.auth.credentials, &self.auth.target_credentials]
            .into_iter()
            .flatten()
        {
            if creds.username.is_empty() {
                return Err(IscsiError::Config("CHAP username is empty".to_string()));
            }
            if creds.secret.len() < CHAP_SECRET_MIN_LEN {
                log::warn!(
                    "CHAP secret for {} is shorter than {} bytes",
                    creds.username,
                    CHAP_SECRET_MIN_LEN
                );
            }
        }

        for def in params::KEYS.iter().filter(|k| k.scope == Scope::Session) {
            if let Some(value) = self.session.value(def.name) {
                def.validate(&value)
                    .map_err(|e| IscsiError::Config(e.to_string()))?;
            }
        }
        if self.session.first_burst_length > self.session.max_burst_length {
            return Err(IscsiError::Config(format!(
                "FirstBurstLength {} exceeds MaxBurstLength {}",
                self.session.first_burst_length, self.session.max_burst_length
            )));
        }

        let max_recv_data_segment_len = self
            .max_recv_data_segment_len
            .unwrap_or(params::DEFAULT_SEGMENT_LENGTH);
        params::lookup(params::MAX_RECV_DATA_SEGMENT_LENGTH)
            .ok_or_else(|| IscsiError::Config("registry lacks MaxRecvDataSegmentLength".to_string()))?
            .validate(&max_recv_data_segment_len.to_string())
            .map_err(|e| IscsiError::Config(e.to_string()))?;

        if self.timeouts.login.is_zero() || self.timeouts.auth.is_zero() || self.timeouts.active.is_zero() {
            return Err(IscsiError::Config("login timeouts must be non-zero".to_string()));
        }

        Ok(NodeRecord {
            initiator_name,
            initiator_alias: self.initiator_alias.filter(|a| !a.is_empty()),
            target_name,
            portal,
            portal_group_tag: self.portal_group_tag,
            session_type: self.session_type,
            isid: self.isid.unwrap_or(DEFAULT_ISID),
            auth: self.auth,
            session: self.session,
            header_digest: self.header_digest,
            data_digest: self.data_digest,
            max_recv_data_segment_len,
            timeouts: self.timeouts,
            tcp_window_size: self.tcp_window_size,
            type_of_service: self.type_of_service,
            provider: self.provider,
            retry: self.retry,
        })
    }
}

/// Contents of the initiator name file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorName {
    pub name: String,
    pub alias: Option<String>,
}

/// Parse `InitiatorName=` / `InitiatorAlias=` lines; `#` starts a comment
pub fn parse_initiator_name(contents: &str) -> IscsiResult<InitiatorName> {
    let mut name = None;
    let mut alias = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some(("InitiatorName", v)) => name = Some(v.trim().to_string()),
            Some(("InitiatorAlias", v)) => alias = Some(v.trim().to_string()),
            _ => log::debug!("ignoring initiator name file line {:?}", line),
        }
    }

    let name = name.ok_or_else(|| {
        IscsiError::Config("no InitiatorName= line in initiator name file".to_string())
    })?;
    validate_iscsi_name(&name)?;

    Ok(InitiatorName {
        name,
        alias: alias.filter(|a| !a.is_empty()),
    })
}

/// Read the persisted initiator name
pub fn read_initiator_name(path: impl AsRef<Path>) -> IscsiResult<InitiatorName> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_initiator_name(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ChapCredentials;

    fn base() -> NodeRecordBuilder {
        NodeRecord::builder()
            .initiator_name("iqn.2024-01.com.example:host1")
            .target_name("iqn.2024-01.com.example:storage.lun1")
            .portal("192.168.1.10")
    }

    #[test]
    fn test_name_formats() {
        assert!(validate_iscsi_name("iqn.2024-01.com.example:host1").is_ok());
        assert!(validate_iscsi_name("eui.02004567A425678D").is_ok());
        assert!(validate_iscsi_name("naa.52004567BA64678D").is_ok());
        assert!(validate_iscsi_name("naa.62004567BA64678D0123456789ABCDEF").is_ok());

        assert!(validate_iscsi_name("iqn.24-01.com.example").is_err());
        assert!(validate_iscsi_name("eui.1234").is_err());
        assert!(validate_iscsi_name("host1").is_err());
        assert!(validate_iscsi_name("iqn.2024-01.com.example:has space").is_err());
        assert!(validate_iscsi_name("").is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let rec = base().build().unwrap();
        assert_eq!(rec.portal, Portal::new("192.168.1.10", 3260));
        assert_eq!(rec.isid, DEFAULT_ISID);
        assert_eq!(rec.session_type, SessionType::Normal);
        assert_eq!(rec.max_recv_data_segment_len, 8192);
        assert_eq!(rec.provider, ProviderType::SoftTcp);
        assert!(!rec.auth.requires_auth());
    }

    #[test]
    fn test_builder_requires_target_for_normal_sessions() {
        let err = NodeRecord::builder()
            .initiator_name("iqn.2024-01.com.example:host1")
            .portal("10.0.0.1")
            .build()
            .unwrap_err();
        assert!(matches!(err, IscsiError::Config(_)));

        let discovery = NodeRecord::builder()
            .initiator_name("iqn.2024-01.com.example:host1")
            .portal("10.0.0.1:3261")
            .session_type(SessionType::Discovery)
            .build()
            .unwrap();
        assert!(discovery.target_name.is_empty());
    }

    #[test]
    fn test_builder_checks_negotiation_bounds() {
        let params = SessionParams {
            first_burst_length: 131072,
            max_burst_length: 65536,
            ..SessionParams::default()
        };
        assert!(base().session_params(params).build().is_err());

        let params = SessionParams {
            error_recovery_level: 3,
            ..SessionParams::default()
        };
        assert!(base().session_params(params).build().is_err());

        assert!(base().max_recv_data_segment_len(100).build().is_err());
    }

    #[test]
    fn test_builder_checks_auth() {
        let mutual_only = AuthConfig {
            credentials: None,
            target_credentials: Some(ChapCredentials::new("tgt", "targetsecret1")),
            allow_none: false,
        };
        assert!(base().auth(mutual_only).build().is_err());

        let chap = AuthConfig::chap(ChapCredentials::new("user", "short"));
        assert!(base().auth(chap).build().is_ok());
    }

    #[test]
    fn test_parse_initiator_name_file() {
        let contents = "\
## DO NOT EDIT OR REMOVE THIS FILE!
InitiatorName=iqn.1993-08.org.debian:01:abcdef
InitiatorAlias=host1
";
        let parsed = parse_initiator_name(contents).unwrap();
        assert_eq!(parsed.name, "iqn.1993-08.org.debian:01:abcdef");
        assert_eq!(parsed.alias.as_deref(), Some("host1"));

        assert!(parse_initiator_name("# nothing here\n").is_err());
        assert!(parse_initiator_name("InitiatorName=bogus\n").is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_initiator_name("/nonexistent/initiatorname.iscsi").unwrap_err();
        assert!(matches!(err, IscsiError::Io(_)));
    }
}
