//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary format of the PDUs an initiator exchanges
//! while logging in and out, based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, IscsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Largest value the 24-bit DataSegmentLength field can carry
pub const MAX_DATA_SEGMENT_LENGTH: usize = 0x00FF_FFFF;

/// Protocol version this initiator speaks (VersionMax = VersionMin = 0)
pub const ISCSI_DRAFT20_VERSION: u8 = 0x00;

/// Not defined by iSCSI; marks a connection that has not sent its first Login PDU
pub const ISCSI_INITIAL_LOGIN_STAGE: i8 = -1;

/// Longest key name allowed in a text segment (RFC 3720 Section 5.1)
pub const MAX_KEY_LENGTH: usize = 63;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags used during login and logout
pub mod flags {
    pub const FINAL: u8 = 0x80;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG in bits 2-3, NSG in bits 0-1)
    pub const CSG_MASK: u8 = 0x0C;
    pub const CSG_SHIFT: u8 = 2;
    pub const NSG_MASK: u8 = 0x03;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    // Status detail codes, per class
    pub const TARGET_MOVED_TEMPORARILY: u8 = 0x01;
    pub const TARGET_MOVED_PERMANENTLY: u8 = 0x02;

    pub const INITIATOR_ERROR_GENERIC: u8 = 0x00;
    pub const AUTH_FAILURE: u8 = 0x01;
    pub const AUTHORIZATION_FAILURE: u8 = 0x02;
    pub const TARGET_NOT_FOUND: u8 = 0x03;
    pub const TARGET_REMOVED: u8 = 0x04;
    pub const UNSUPPORTED_VERSION: u8 = 0x05;
    pub const TOO_MANY_CONNECTIONS: u8 = 0x06;
    pub const MISSING_PARAMETER: u8 = 0x07;
    pub const CANT_INCLUDE_IN_SESSION: u8 = 0x08;
    pub const SESSION_TYPE_NOT_SUPPORTED: u8 = 0x09;
    pub const SESSION_DOES_NOT_EXIST: u8 = 0x0A;
    pub const INVALID_DURING_LOGIN: u8 = 0x0B;

    pub const TARGET_ERROR_GENERIC: u8 = 0x00;
    pub const SERVICE_UNAVAILABLE: u8 = 0x01;
    pub const OUT_OF_RESOURCES: u8 = 0x02;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Login negotiation stages carried in the CSG/NSG fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoginStage {
    /// Nothing sent yet on this connection (`ISCSI_INITIAL_LOGIN_STAGE`)
    Initial,
    /// SecurityNegotiation (0)
    Security,
    /// LoginOperationalNegotiation (1)
    Operational,
    /// FullFeaturePhase (3)
    FullFeature,
}

impl LoginStage {
    /// Value carried in the 2-bit CSG/NSG fields
    pub fn to_wire(self) -> Option<u8> {
        match self {
            LoginStage::Initial => None,
            LoginStage::Security => Some(0),
            LoginStage::Operational => Some(1),
            LoginStage::FullFeature => Some(3),
        }
    }

    /// Decode a CSG/NSG field; 2 is reserved
    pub fn from_wire(v: u8) -> Option<Self> {
        match v & 0x03 {
            0 => Some(LoginStage::Security),
            1 => Some(LoginStage::Operational),
            3 => Some(LoginStage::FullFeature),
            _ => None,
        }
    }

    /// Numeric stage as used by the connection state (-1 for the initial stage)
    pub fn as_raw(self) -> i8 {
        match self.to_wire() {
            Some(v) => v as i8,
            None => ISCSI_INITIAL_LOGIN_STAGE,
        }
    }
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (VersionMax/VersionMin or VersionMax/VersionActive for login)
    pub opcode_fields: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number, or ISID+TSIH for login (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            opcode_fields: [0u8; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the data segment.
    pub fn from_bytes(buf: &[u8]) -> IscsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;

        // Byte 1: Flags (opcode-specific)
        let flags = cursor.read_u8()?;

        // Bytes 2-3: opcode-specific
        let opcode_fields = [cursor.read_u8()?, cursor.read_u8()?];

        // Byte 4: Total AHS Length (4-byte units)
        let ahs_length = cursor.read_u8()?;

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let ds_len_high = cursor.read_u8()? as u32;
        let ds_len_low = cursor.read_u16::<BigEndian>()? as u32;
        let data_length = (ds_len_high << 16) | ds_len_low;

        // Bytes 8-15: LUN
        let lun = cursor.read_u64::<BigEndian>()?;

        // Bytes 16-19: Initiator Task Tag
        let itt = cursor.read_u32::<BigEndian>()?;

        // Bytes 20-47: Opcode-specific fields
        let mut specific = [0u8; 28];
        std::io::Read::read_exact(&mut cursor, &mut specific)?;

        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = (data_length as usize).div_ceil(4) * 4;
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        // Login PDUs never carry an AHS; skip it if present
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            opcode_fields,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data,
        })
    }

    /// Serialize the 48-byte BHS
    pub fn header_bytes(&self) -> [u8; BHS_SIZE] {
        let mut bhs = [0u8; BHS_SIZE];

        bhs[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        bhs[1] = self.flags;
        bhs[2..4].copy_from_slice(&self.opcode_fields);
        bhs[4] = self.ahs_length;

        // DataSegmentLength always reflects the data actually carried
        let data_len = self.data.len() as u32;
        bhs[5] = ((data_len >> 16) & 0xFF) as u8;
        BigEndian::write_u16(&mut bhs[6..8], (data_len & 0xFFFF) as u16);

        BigEndian::write_u64(&mut bhs[8..16], self.lun);
        BigEndian::write_u32(&mut bhs[16..20], self.itt);
        bhs[20..48].copy_from_slice(&self.specific);
        bhs
    }

    /// Serialize PDU to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len = self.total_length();
        let mut buf = Vec::with_capacity(total_len);
        buf.extend_from_slice(&self.header_bytes());

        // AHS is never emitted by the initiator
        buf.extend_from_slice(&self.data);

        // Pad to 4-byte boundary
        buf.resize(total_len, 0);
        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        BHS_SIZE + ahs_bytes + padded_data_len
    }
}

/// Split a 3-byte DataSegmentLength out of a raw BHS
pub fn data_segment_length(bhs: &[u8]) -> usize {
    ((bhs[5] as usize) << 16) | ((bhs[6] as usize) << 8) | (bhs[7] as usize)
}

fn isid_tsih_to_lun(isid: [u8; 6], tsih: u16) -> u64 {
    let mut lun_bytes = [0u8; 8];
    lun_bytes[0..6].copy_from_slice(&isid);
    lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
    u64::from_be_bytes(lun_bytes)
}

fn lun_to_isid_tsih(lun: u64) -> ([u8; 6], u16) {
    let lun_bytes = lun.to_be_bytes();
    let mut isid = [0u8; 6];
    isid.copy_from_slice(&lun_bytes[0..6]);
    (isid, BigEndian::read_u16(&lun_bytes[6..8]))
}

fn stage_flags(transit: bool, cont: bool, csg: u8, nsg: u8) -> u8 {
    (if transit { flags::TRANSIT } else { 0 })
        | (if cont { flags::CONTINUE_LOGIN } else { 0 })
        | ((csg & 0x03) << flags::CSG_SHIFT)
        | (nsg & flags::NSG_MASK)
}

// ============================================================================
// Login Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        itt: u32,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        cont: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;
        pdu.flags = stage_flags(transit, cont, csg, nsg);

        // VersionMax, VersionMin
        pdu.opcode_fields = [ISCSI_DRAFT20_VERSION, ISCSI_DRAFT20_VERSION];

        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;

        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        // Bytes 24-27: CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // Bytes 28-31: ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }

    /// Parse Login Request fields
    pub fn parse_login_request(&self) -> IscsiResult<LoginRequest> {
        if self.opcode != opcode::LOGIN_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Login Request opcode 0x03, got 0x{:02x}",
                self.opcode
            )));
        }

        let (isid, tsih) = lun_to_isid_tsih(self.lun);

        Ok(LoginRequest {
            isid,
            tsih,
            itt: self.itt,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            version_max: self.opcode_fields[0],
            version_min: self.opcode_fields[1],
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags & flags::CSG_MASK) >> flags::CSG_SHIFT,
            nsg: self.flags & flags::NSG_MASK,
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Create a Login Response PDU
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_RESPONSE;
        pdu.flags = stage_flags(transit, false, csg, nsg);

        // VersionMax, VersionActive
        pdu.opcode_fields = [ISCSI_DRAFT20_VERSION, ISCSI_DRAFT20_VERSION];

        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;

        // Bytes 24-27: StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // Bytes 28-31: ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // Bytes 32-35: MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // Bytes 36-37: Status-Class and Status-Detail
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }

    /// Parse Login Response fields
    ///
    /// Only the framing is checked here; the text segment is kept raw because
    /// it may be one fragment of a partial response.
    pub fn parse_login_response(&self) -> IscsiResult<LoginResponse> {
        if self.opcode != opcode::LOGIN_RESPONSE {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Login Response opcode 0x23, got 0x{:02x} ({})",
                self.opcode,
                self.opcode_name()
            )));
        }
        if self.data.len() != self.data_length as usize {
            return Err(IscsiError::InvalidPdu(format!(
                "Login Response data length {} does not match DataSegmentLength {}",
                self.data.len(),
                self.data_length
            )));
        }

        let (isid, tsih) = lun_to_isid_tsih(self.lun);

        Ok(LoginResponse {
            isid,
            tsih,
            itt: self.itt,
            version_max: self.opcode_fields[0],
            version_active: self.opcode_fields[1],
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags & flags::CSG_MASK) >> flags::CSG_SHIFT,
            nsg: self.flags & flags::NSG_MASK,
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            status_class: self.specific[16],
            status_detail: self.specific[17],
            data: self.data.clone(),
        })
    }
}

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub version_max: u8,
    pub version_min: u8,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub parameters: Vec<(String, String)>,
}

/// Parsed Login Response
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub version_max: u8,
    pub version_active: u8,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub data: Vec<u8>,
}

// ============================================================================
// Logout Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Logout Request PDU
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_REQUEST;
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.itt = itt;

        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        // CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu
    }

    /// Parse Logout Response
    pub fn parse_logout_response(&self) -> IscsiResult<LogoutResponse> {
        if self.opcode != opcode::LOGOUT_RESPONSE {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Logout Response opcode 0x26, got 0x{:02x}",
                self.opcode
            )));
        }

        Ok(LogoutResponse {
            itt: self.itt,
            response: self.specific[0],
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            time2wait: BigEndian::read_u16(&self.specific[20..22]),
            time2retain: BigEndian::read_u16(&self.specific[22..24]),
        })
    }

    /// Create a Logout Response PDU
    pub fn logout_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        time2wait: u16,
        time2retain: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.itt = itt;

        pdu.specific[0] = response;
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[20..22].copy_from_slice(&time2wait.to_be_bytes());
        pdu.specific[22..24].copy_from_slice(&time2retain.to_be_bytes());

        pdu
    }
}

/// Parsed Logout Response
#[derive(Debug, Clone)]
pub struct LogoutResponse {
    pub itt: u32,
    pub response: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
///
/// Framing is strict: every pair must be NUL terminated, carry a non-empty key
/// of at most 63 bytes and an `=` separator. Trailing NUL padding is accepted.
pub fn parse_text_parameters(data: &[u8]) -> IscsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    if data.is_empty() {
        return Ok(params);
    }

    if data[data.len() - 1] != 0 {
        return Err(IscsiError::InvalidPdu(
            "text segment is not NUL terminated".to_string(),
        ));
    }

    // Everything after the first empty record must be padding
    let mut chunks = data[..data.len() - 1].split(|&b| b == 0);
    for chunk in chunks.by_ref() {
        if chunk.is_empty() {
            break;
        }

        let s = std::str::from_utf8(chunk)
            .map_err(|e| IscsiError::InvalidPdu(format!("text key is not UTF-8: {}", e)))?;
        let eq_pos = s
            .find('=')
            .ok_or_else(|| IscsiError::InvalidPdu(format!("text key without '=': {:?}", s)))?;

        let key = &s[..eq_pos];
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(IscsiError::InvalidPdu(format!(
                "text key length {} outside 1..={}",
                key.len(),
                MAX_KEY_LENGTH
            )));
        }
        params.push((key.to_string(), s[eq_pos + 1..].to_string()));
    }

    if chunks.any(|chunk| !chunk.is_empty()) {
        return Err(IscsiError::InvalidPdu(
            "embedded NUL inside text segment".to_string(),
        ));
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================
