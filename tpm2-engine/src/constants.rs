// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants, command codes and response codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum TpmCc {
    PolicySigned = 0x00000160,
    PolicySecret = 0x00000151,
    FlushContext = 0x00000165,
    PolicyAuthorize = 0x0000016A,
    PolicyAuthValue = 0x0000016B,
    PolicyCommandCode = 0x0000016C,
    PolicyTicket = 0x00000172,
    StartAuthSession = 0x00000176,
    VerifySignature = 0x00000177,
    PolicyPcr = 0x0000017F,
    PolicyGetDigest = 0x00000189,
    PolicyPassword = 0x0000018C,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00000160 => Some(TpmCc::PolicySigned),
            0x00000151 => Some(TpmCc::PolicySecret),
            0x00000165 => Some(TpmCc::FlushContext),
            0x0000016A => Some(TpmCc::PolicyAuthorize),
            0x0000016B => Some(TpmCc::PolicyAuthValue),
            0x0000016C => Some(TpmCc::PolicyCommandCode),
            0x00000172 => Some(TpmCc::PolicyTicket),
            0x00000176 => Some(TpmCc::StartAuthSession),
            0x00000177 => Some(TpmCc::VerifySignature),
            0x0000017F => Some(TpmCc::PolicyPcr),
            0x00000189 => Some(TpmCc::PolicyGetDigest),
            0x0000018C => Some(TpmCc::PolicyPassword),
            _ => None,
        }
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
///
/// Format-1 codes (`0x080` bit set) may additionally carry a handle,
/// parameter or session index, see [`tpm_rc::with_handle`] and friends.
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;
    pub const BAD_TAG: u32 = 0x01E;

    // Format 0, version 1
    pub const FAILURE: u32 = 0x101;
    pub const PCR_CHANGED: u32 = 0x128;
    pub const COMMAND_SIZE: u32 = 0x142;
    pub const COMMAND_CODE: u32 = 0x143;
    pub const AUTHSIZE: u32 = 0x144;
    pub const CPHASH: u32 = 0x151;

    // Format 1
    pub const VALUE: u32 = 0x084;
    pub const HIERARCHY: u32 = 0x085;
    pub const HANDLE: u32 = 0x08B;
    pub const NONCE: u32 = 0x08F;
    pub const SIZE: u32 = 0x095;
    pub const SIGNATURE: u32 = 0x09B;
    pub const POLICY_FAIL: u32 = 0x09D;
    pub const TICKET: u32 = 0x0A0;
    pub const EXPIRED: u32 = 0x0A3;
    pub const POLICY_CC: u32 = 0x0A4;

    // Warnings
    pub const SESSION_MEMORY: u32 = 0x903;
    pub const MEMORY: u32 = 0x904;

    const FMT1: u32 = 0x080;
    const P: u32 = 0x040;
    const S: u32 = 0x800;

    pub fn is_format_one(rc: u32) -> bool {
        rc & FMT1 != 0
    }

    /// Attach a 1-based handle index to a format-1 code
    pub fn with_handle(rc: u32, index: u8) -> u32 {
        rc | ((index as u32 & 0x7) << 8)
    }

    /// Attach a 1-based parameter index to a format-1 code
    pub fn with_parameter(rc: u32, index: u8) -> u32 {
        rc | P | ((index as u32 & 0xF) << 8)
    }

    /// Attach a 1-based session index to a format-1 code
    pub fn with_session(rc: u32, index: u8) -> u32 {
        rc | S | ((index as u32 & 0x7) << 8)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Rsa = 0x0001,
    Ecc = 0x0023,
    Aes = 0x0006,
    Xor = 0x000A,
    Cfb = 0x0043,
    RsaSsa = 0x0014,
    EcDsa = 0x0018,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0001 => Some(TpmAlgId::Rsa),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0006 => Some(TpmAlgId::Aes),
            0x000A => Some(TpmAlgId::Xor),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0018 => Some(TpmAlgId::EcDsa),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    pub fn base(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }

    pub fn is_policy(self) -> bool {
        matches!(self, TpmSe::Policy | TpmSe::Trial)
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn continue_session(self) -> bool {
        self.0 & Self::CONTINUE_SESSION != 0
    }
}

/// TPM structure tags: command envelope tags and ticket tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Verified = 0x8022,
    AuthSecret = 0x8023,
    AuthSigned = 0x8025,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8000 => Some(TpmSt::Null),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8022 => Some(TpmSt::Verified),
            0x8023 => Some(TpmSt::AuthSecret),
            0x8025 => Some(TpmSt::AuthSigned),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
}

/// Size of the envelope header: tag (2) + size (4) + command/response code (4)
pub const HEADER_SIZE: usize = 10;
/// Largest digest any supported hash produces
pub const MAX_DIGEST_SIZE: usize = 64;
/// Name = nameAlg (2) + digest
pub const MAX_NAME_SIZE: usize = 2 + MAX_DIGEST_SIZE;
/// Expiration time (8) + reset count (4)
pub const TIMEOUT_SIZE: usize = 12;
/// Encrypted salt, bounded by the largest supported RSA modulus
pub const MAX_ENCRYPTED_SECRET_SIZE: usize = 512;
/// Signature component, bounded by the largest supported RSA modulus
pub const MAX_SIGNATURE_SIZE: usize = 512;
/// Number of implemented PCR banks
pub const HASH_COUNT: usize = 4;
/// Bytes of PCR select bitmap (24 PCRs)
pub const PCR_SELECT_MAX: usize = 3;
/// PCRs per bank
pub const IMPLEMENTATION_PCR: usize = PCR_SELECT_MAX * 8;
/// Authorization sessions per command
pub const MAX_SESSION_NUM: usize = 3;
/// Smallest nonce a caller may supply to StartAuthSession
pub const MIN_NONCE_SIZE: usize = 16;
