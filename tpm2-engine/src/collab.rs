// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the services the command core consumes but does not own
//!
//! Software implementations live in [`crate::soft`].

use super::constants::TpmAlgId;
use super::error::Result;
use super::types::{Tpm2bName, TpmlPcrSelection, TpmtSignature};

/// Public part of a loaded signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Big-endian modulus; an exponent of 0 means the default 65537
    Rsa { modulus: Vec<u8>, exponent: u32 },
    /// Affine coordinates on NIST P-256
    Ecc { x: Vec<u8>, y: Vec<u8> },
}

/// An entity a handle refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub handle: u32,
    pub name: Tpm2bName,
    /// Hierarchy the entity belongs to (`TPM_RH_NULL` for ephemeral objects)
    pub hierarchy: u32,
    pub public: Option<PublicKey>,
}

/// Resolves handles to loaded entities
pub trait ObjectResolver: Send {
    fn resolve(&self, handle: u32) -> Option<Entity>;
}

/// Read-only view of the PCR banks
pub trait PcrBank: Send {
    /// Hash, with `alg`, of the concatenated values of every selected PCR
    fn current_digest(&self, selection: &TpmlPcrSelection, alg: TpmAlgId) -> Result<Vec<u8>>;

    /// Counter bumped on every PCR change
    fn update_counter(&self) -> u32;
}

/// Stateless cryptographic primitives
pub trait CryptoProvider: Send {
    fn hash(&self, alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>>;

    fn hmac(&self, alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>>;

    /// Check `signature` over an already computed `digest`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify.
    fn verify_signature(
        &self,
        key: &PublicKey,
        digest: &[u8],
        signature: &TpmtSignature,
    ) -> Result<bool>;

    fn random(&self, len: usize) -> Vec<u8>;
}

/// Reset-safe clock used for expirations
pub trait Clock: Send {
    /// Milliseconds since the last TPM reset
    fn now(&self) -> u64;

    fn reset_count(&self) -> u32;
}

/// Static per-command facts
pub trait CommandMetadata: Send {
    fn is_implemented(&self, code: u32) -> bool;

    fn handle_count(&self, code: u32) -> Option<usize>;
}
