// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use super::constants::*;
use super::error::{Result, TpmError};
use super::marshal::*;

/// Declare a TPM2B buffer type whose size is bounded by `$max`
macro_rules! tpm2b_type {
    ($(#[$doc:meta])* $name:ident, $max:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub const MAX_SIZE: usize = $max;

            pub fn new(data: Vec<u8>) -> Self {
                Self { buffer: data }
            }

            pub fn empty() -> Self {
                Self { buffer: Vec::new() }
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.buffer
            }

            pub fn len(&self) -> usize {
                self.buffer.len()
            }

            pub fn is_empty(&self) -> bool {
                self.buffer.is_empty()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(data: Vec<u8>) -> Self {
                Self::new(data)
            }
        }

        impl From<&[u8]> for $name {
            fn from(data: &[u8]) -> Self {
                Self::new(data.to_vec())
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut WriteBuffer) {
                buf.put_tpm2b(&self.buffer);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b(Self::MAX_SIZE)?,
                })
            }
        }
    };
}

tpm2b_type!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest,
    MAX_DIGEST_SIZE
);

tpm2b_type!(
    /// TPM2B_NAME - nameAlg followed by the digest of the public area
    Tpm2bName,
    MAX_NAME_SIZE
);

tpm2b_type!(
    /// TPM2B_AUTH - Authorization value or session HMAC
    Tpm2bAuth,
    MAX_DIGEST_SIZE
);

tpm2b_type!(
    /// TPM2B_ENCRYPTED_SECRET - Encrypted salt for StartAuthSession
    Tpm2bEncryptedSecret,
    MAX_ENCRYPTED_SECRET_SIZE
);

tpm2b_type!(
    /// TPM2B_PUBLIC_KEY_RSA - RSA signature or modulus
    Tpm2bPublicKeyRsa,
    MAX_SIGNATURE_SIZE
);

tpm2b_type!(
    /// TPM2B_ECC_PARAMETER - ECC coordinate or signature component
    Tpm2bEccParameter,
    MAX_DIGEST_SIZE
);

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

impl Tpm2bDigest {
    /// Zero-filled digest of the given length
    pub fn zeroed(len: usize) -> Self {
        Self {
            buffer: vec![0u8; len],
        }
    }
}

impl Tpm2bName {
    /// The name algorithm, if the name carries one
    pub fn name_alg(&self) -> Option<TpmAlgId> {
        match self.buffer.as_slice() {
            [hi, lo, ..] => TpmAlgId::from_u16(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

/// TPM2B_TIMEOUT - Empty, or a 12-byte expiration record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bTimeout {
    pub buffer: Vec<u8>,
}

impl Tpm2bTimeout {
    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn new(expires_at: u64, reset_count: u32) -> Self {
        let mut buffer = Vec::with_capacity(TIMEOUT_SIZE);
        buffer.extend_from_slice(&expires_at.to_be_bytes());
        buffer.extend_from_slice(&reset_count.to_be_bytes());
        Self { buffer }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Decode `(expires_at, reset_count)`; `None` for a timeout that never expires
    pub fn expiration(&self) -> Option<(u64, u32)> {
        if self.buffer.len() != TIMEOUT_SIZE {
            return None;
        }
        let mut buf = ReadBuffer::new(&self.buffer);
        let expires_at = buf.get_u64().ok()?;
        let reset_count = buf.get_u32().ok()?;
        Some((expires_at, reset_count))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Marshal for Tpm2bTimeout {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bTimeout {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let buffer = buf.get_tpm2b(TIMEOUT_SIZE)?;
        if !buffer.is_empty() && buffer.len() != TIMEOUT_SIZE {
            return Err(TpmError::Size);
        }
        Ok(Self { buffer })
    }
}

impl Marshal for TpmAlgId {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u16(self.to_u16());
    }
}

impl Unmarshal for TpmAlgId {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        TpmAlgId::from_u16(buf.get_u16()?).ok_or(TpmError::Value)
    }
}

/// TPMI_ALG_HASH - an algorithm restricted to the implemented hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmiAlgHash(pub TpmAlgId);

impl Marshal for TpmiAlgHash {
    fn marshal(&self, buf: &mut WriteBuffer) {
        self.0.marshal(buf);
    }
}

impl Unmarshal for TpmiAlgHash {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let alg = TpmAlgId::unmarshal(buf)?;
        if !alg.is_hash() {
            return Err(TpmError::Value);
        }
        Ok(Self(alg))
    }
}

impl Marshal for TpmSe {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u8(*self as u8);
    }
}

impl Unmarshal for TpmSe {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        TpmSe::from_u8(buf.get_u8()?).ok_or(TpmError::Value)
    }
}

impl Marshal for TpmaSa {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u8(self.0);
    }
}

impl Unmarshal for TpmaSa {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        Ok(TpmaSa(buf.get_u8()?))
    }
}

impl Marshal for TpmSt {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u16(self.to_u16());
    }
}

impl Unmarshal for TpmSt {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        TpmSt::from_u16(buf.get_u16()?).ok_or(TpmError::Value)
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    /// Select `pcrs` in the bank of `hash`; indices past the last PCR are ignored
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        let mut pcr_select = vec![0u8; PCR_SELECT_MAX];
        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            let bit_idx = pcr % 8;
            if byte_idx < pcr_select.len() {
                pcr_select[byte_idx] |= 1 << bit_idx;
            }
        }
        Self { hash, pcr_select }
    }

    /// Selected PCR indices in ascending order
    pub fn selected(&self) -> impl Iterator<Item = usize> + '_ {
        self.pcr_select.iter().enumerate().flat_map(|(byte_idx, bits)| {
            (0..8)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| byte_idx * 8 + bit)
        })
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let TpmiAlgHash(hash) = TpmiAlgHash::unmarshal(buf)?;
        let size = buf.get_u8()? as usize;
        if size > PCR_SELECT_MAX {
            return Err(TpmError::Value);
        }
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > HASH_COUNT {
            return Err(TpmError::Size);
        }
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        match self.algorithm {
            TpmAlgId::Null => {}
            // The hash algorithm travels in `key_bits`
            TpmAlgId::Xor => buf.put_u16(self.key_bits),
            _ => {
                buf.put_u16(self.key_bits);
                buf.put_u16(self.mode.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let algorithm = TpmAlgId::unmarshal(buf)?;
        match algorithm {
            TpmAlgId::Null => Ok(Self::null()),
            TpmAlgId::Xor => {
                // XOR carries a hash algorithm in place of key bits and no mode
                let TpmiAlgHash(hash) = TpmiAlgHash::unmarshal(buf)?;
                Ok(Self {
                    algorithm,
                    key_bits: hash.to_u16(),
                    mode: TpmAlgId::Null,
                })
            }
            TpmAlgId::Aes => {
                let key_bits = buf.get_u16()?;
                let mode = TpmAlgId::unmarshal(buf)?;
                Ok(Self {
                    algorithm,
                    key_bits,
                    mode,
                })
            }
            _ => Err(TpmError::Value),
        }
    }
}

/// TPMT_TK_VERIFIED / TPMT_TK_AUTH - a ticket issued by the TPM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTicket {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl TpmtTicket {
    /// A NULL ticket of the given kind, which never verifies
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag,
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.hierarchy == tpm_rh::NULL
    }
}

impl Marshal for TpmtTicket {
    fn marshal(&self, buf: &mut WriteBuffer) {
        self.tag.marshal(buf);
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTicket {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        let tag = TpmSt::unmarshal(buf)?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMT_SIGNATURE - Signature structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Null,
    RsaSsa {
        hash: TpmAlgId,
        sig: Tpm2bPublicKeyRsa,
    },
    EcDsa {
        hash: TpmAlgId,
        r: Tpm2bEccParameter,
        s: Tpm2bEccParameter,
    },
}

impl TpmtSignature {
    pub fn sig_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::Null => TpmAlgId::Null,
            TpmtSignature::RsaSsa { .. } => TpmAlgId::RsaSsa,
            TpmtSignature::EcDsa { .. } => TpmAlgId::EcDsa,
        }
    }

    pub fn hash_alg(&self) -> Option<TpmAlgId> {
        match self {
            TpmtSignature::Null => None,
            TpmtSignature::RsaSsa { hash, .. } | TpmtSignature::EcDsa { hash, .. } => Some(*hash),
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut WriteBuffer) {
        self.sig_alg().marshal(buf);
        match self {
            TpmtSignature::Null => {}
            TpmtSignature::RsaSsa { hash, sig } => {
                hash.marshal(buf);
                sig.marshal(buf);
            }
            TpmtSignature::EcDsa { hash, r, s } => {
                hash.marshal(buf);
                r.marshal(buf);
                s.marshal(buf);
            }
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        match TpmAlgId::unmarshal(buf)? {
            TpmAlgId::Null => Ok(TpmtSignature::Null),
            TpmAlgId::RsaSsa => {
                let TpmiAlgHash(hash) = TpmiAlgHash::unmarshal(buf)?;
                let sig = Tpm2bPublicKeyRsa::unmarshal(buf)?;
                Ok(TpmtSignature::RsaSsa { hash, sig })
            }
            TpmAlgId::EcDsa => {
                let TpmiAlgHash(hash) = TpmiAlgHash::unmarshal(buf)?;
                let r = Tpm2bEccParameter::unmarshal(buf)?;
                let s = Tpm2bEccParameter::unmarshal(buf)?;
                Ok(TpmtSignature::EcDsa { hash, r, s })
            }
            _ => Err(TpmError::Value),
        }
    }
}

/// TPMS_AUTH_COMMAND - one entry of a request authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Tpm2bNonce,
    pub attributes: TpmaSa,
    pub hmac: Tpm2bAuth,
}

impl TpmsAuthCommand {
    /// Password authorization with an empty password
    pub fn password() -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSa::new(),
            hmac: Tpm2bAuth::empty(),
        }
    }

    /// Policy session authorization that keeps the session alive
    pub fn policy(session_handle: u32) -> Self {
        Self {
            session_handle,
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSa::new().with_continue_session(),
            hmac: Tpm2bAuth::empty(),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, buf: &mut WriteBuffer) {
        buf.put_u32(self.session_handle);
        self.nonce.marshal(buf);
        self.attributes.marshal(buf);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for TpmsAuthCommand {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: Tpm2bNonce::unmarshal(buf)?,
            attributes: TpmaSa::unmarshal(buf)?,
            hmac: Tpm2bAuth::unmarshal(buf)?,
        })
    }
}

/// TPMS_AUTH_RESPONSE - one entry of a response authorization area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Tpm2bNonce,
    pub attributes: TpmaSa,
    pub hmac: Tpm2bAuth,
}

impl Marshal for TpmsAuthResponse {
    fn marshal(&self, buf: &mut WriteBuffer) {
        self.nonce.marshal(buf);
        self.attributes.marshal(buf);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(buf: &mut ReadBuffer) -> Result<Self> {
        Ok(Self {
            nonce: Tpm2bNonce::unmarshal(buf)?,
            attributes: TpmaSa::unmarshal(buf)?,
            hmac: Tpm2bAuth::unmarshal(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_bytes() {
        let sel = TpmlPcrSelection::single(TpmAlgId::Sha256, &[7]);
        assert_eq!(hex::encode(sel.to_bytes()), "00000001000b03800000");
        assert_eq!(sel.pcr_selections[0].selected().collect::<Vec<_>>(), vec![7]);

        let sel = TpmsPcrSelection::new(TpmAlgId::Sha256, &[0, 10, 23, 24]);
        assert_eq!(sel.pcr_select, vec![0x01, 0x04, 0x80]);
        assert_eq!(sel.selected().collect::<Vec<_>>(), vec![0, 10, 23]);
    }

    #[test]
    fn test_pcr_selection_limits() {
        // Select bitmap larger than the implemented PCR count
        let data = hex::decode("00000001000b0400000000").unwrap();
        assert_eq!(TpmlPcrSelection::from_bytes(&data), Err(TpmError::Value));

        // Not a hash algorithm
        let data = hex::decode("00000001000103000000").unwrap();
        assert_eq!(TpmlPcrSelection::from_bytes(&data), Err(TpmError::Value));

        // More banks than implemented
        let data = hex::decode("00000005").unwrap();
        assert_eq!(TpmlPcrSelection::from_bytes(&data), Err(TpmError::Size));
    }

    #[test]
    fn test_timeout_layout() {
        let timeout = Tpm2bTimeout::new(0x0102030405060708, 9);
        assert_eq!(
            hex::encode(timeout.to_bytes()),
            "000c010203040506070800000009"
        );
        assert_eq!(timeout.expiration(), Some((0x0102030405060708, 9)));
        assert_eq!(Tpm2bTimeout::empty().expiration(), None);

        // Only empty and full-size timeouts are accepted
        let data = hex::decode("0004aabbccdd").unwrap();
        assert_eq!(Tpm2bTimeout::from_bytes(&data), Err(TpmError::Size));
    }

    #[test]
    fn test_signature_variants() {
        let sig = TpmtSignature::EcDsa {
            hash: TpmAlgId::Sha256,
            r: vec![1, 2].into(),
            s: vec![3].into(),
        };
        let bytes = sig.to_bytes();
        assert_eq!(hex::encode(&bytes), "0018000b00020102000103");
        assert_eq!(TpmtSignature::from_bytes(&bytes).unwrap(), sig);

        assert_eq!(TpmtSignature::from_bytes(&[0x00, 0x10]).unwrap(), TpmtSignature::Null);
        assert_eq!(TpmtSignature::from_bytes(&[0x00, 0x01]), Err(TpmError::Value));
    }

    #[test]
    fn test_ticket_and_name() {
        let ticket = TpmtTicket::null(TpmSt::Verified);
        assert_eq!(hex::encode(ticket.to_bytes()), "8022400000070000");
        assert!(TpmtTicket::from_bytes(&ticket.to_bytes()).unwrap().is_null());

        let name = Tpm2bName::new(hex::decode("000b00").unwrap());
        assert_eq!(name.name_alg(), Some(TpmAlgId::Sha256));
        assert_eq!(Tpm2bName::empty().name_alg(), None);
    }
}
