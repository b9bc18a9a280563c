// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Ticket issuance and verification
//!
//! A ticket is an HMAC, keyed with a per-hierarchy proof value, over the fact
//! it attests:
//!
//! - VERIFIED: `tag || digest || keyName`
//! - AUTH_SIGNED / AUTH_SECRET: `tag || timeout || cpHash || policyRef || authName`

use subtle::ConstantTimeEq;
use tracing::warn;

use super::collab::{Clock, CryptoProvider};
use super::config::TpmConfig;
use super::constants::*;
use super::error::{PolicyFault, Result, TpmError};
use super::types::{Tpm2bTimeout, TpmtTicket};

/// Hash used for every ticket HMAC
pub const PROOF_HASH: TpmAlgId = TpmAlgId::Sha256;

const PROOF_LABEL: &[u8] = b"TPM2 hierarchy proof\0";

#[derive(Debug, Clone)]
struct Hierarchy {
    handle: u32,
    proof: Vec<u8>,
    enabled: bool,
}

/// The claim an AUTH ticket covers
#[derive(Debug, Clone, Copy)]
pub struct AuthClaim<'a> {
    pub timeout: &'a Tpm2bTimeout,
    pub cp_hash: &'a [u8],
    pub policy_ref: &'a [u8],
    pub auth_name: &'a [u8],
}

/// Holder of the hierarchy proof values
#[derive(Debug, Clone)]
pub struct TicketAuthority {
    hierarchies: Vec<Hierarchy>,
}

impl TicketAuthority {
    /// Derive the proofs from the configured seed, or draw them at random
    pub fn new(config: &TpmConfig, crypto: &dyn CryptoProvider) -> Result<Self> {
        let enabled = [
            (tpm_rh::OWNER, config.hierarchies.owner),
            (tpm_rh::ENDORSEMENT, config.hierarchies.endorsement),
            (tpm_rh::PLATFORM, config.hierarchies.platform),
        ];
        let mut hierarchies = Vec::with_capacity(enabled.len());
        for (handle, enabled) in enabled {
            let proof = if config.proof_seed.is_empty() {
                crypto.random(PROOF_HASH.digest_size())
            } else {
                crypto.hmac(
                    PROOF_HASH,
                    &config.proof_seed,
                    &[PROOF_LABEL, &handle.to_be_bytes()],
                )?
            };
            hierarchies.push(Hierarchy {
                handle,
                proof,
                enabled,
            });
        }
        Ok(Self { hierarchies })
    }

    pub fn is_enabled(&self, hierarchy: u32) -> bool {
        self.hierarchies
            .iter()
            .any(|h| h.handle == hierarchy && h.enabled)
    }

    pub fn set_enabled(&mut self, hierarchy: u32, enabled: bool) {
        if let Some(h) = self.hierarchies.iter_mut().find(|h| h.handle == hierarchy) {
            h.enabled = enabled;
        }
    }

    /// Proof value for a ticket consumed against `hierarchy`
    fn proof_for(&self, hierarchy: u32) -> Result<&[u8]> {
        let h = self
            .hierarchies
            .iter()
            .find(|h| h.handle == hierarchy)
            .ok_or(TpmError::policy(PolicyFault::TicketInvalid))?;
        if !h.enabled {
            return Err(TpmError::policy(PolicyFault::HierarchyDisabled));
        }
        Ok(&h.proof)
    }

    fn sign(
        &self,
        crypto: &dyn CryptoProvider,
        hierarchy: u32,
        tag: TpmSt,
        parts: &[&[u8]],
    ) -> Result<Vec<u8>> {
        let proof = self.proof_for(hierarchy)?;
        let tag = tag.to_u16().to_be_bytes();
        let mut input: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        input.push(&tag);
        input.extend_from_slice(parts);
        crypto.hmac(PROOF_HASH, proof, &input)
    }

    fn check(
        &self,
        crypto: &dyn CryptoProvider,
        ticket: &TpmtTicket,
        parts: &[&[u8]],
    ) -> Result<()> {
        if ticket.is_null() {
            return Err(TpmError::policy(PolicyFault::TicketInvalid));
        }
        let expected = self.sign(crypto, ticket.hierarchy, ticket.tag, parts)?;
        if !bool::from(expected.as_slice().ct_eq(ticket.digest.as_bytes())) {
            warn!(
                "{:?} ticket for hierarchy 0x{:08x} failed verification",
                ticket.tag, ticket.hierarchy
            );
            return Err(TpmError::policy(PolicyFault::TicketInvalid));
        }
        Ok(())
    }

    /// VERIFIED ticket for `digest` signed by the key named `key_name`
    pub fn issue_verified(
        &self,
        crypto: &dyn CryptoProvider,
        hierarchy: u32,
        digest: &[u8],
        key_name: &[u8],
    ) -> Result<TpmtTicket> {
        if hierarchy == tpm_rh::NULL {
            return Ok(TpmtTicket::null(TpmSt::Verified));
        }
        let hmac = self.sign(crypto, hierarchy, TpmSt::Verified, &[digest, key_name])?;
        Ok(TpmtTicket {
            tag: TpmSt::Verified,
            hierarchy,
            digest: hmac.into(),
        })
    }

    pub fn verify_verified(
        &self,
        crypto: &dyn CryptoProvider,
        ticket: &TpmtTicket,
        digest: &[u8],
        key_name: &[u8],
    ) -> Result<()> {
        if ticket.tag != TpmSt::Verified {
            return Err(TpmError::policy(PolicyFault::TicketInvalid));
        }
        self.check(crypto, ticket, &[digest, key_name])
    }

    /// AUTH_SIGNED or AUTH_SECRET ticket for `claim`
    pub fn issue_auth(
        &self,
        crypto: &dyn CryptoProvider,
        tag: TpmSt,
        hierarchy: u32,
        claim: AuthClaim<'_>,
    ) -> Result<TpmtTicket> {
        if hierarchy == tpm_rh::NULL {
            return Ok(TpmtTicket::null(tag));
        }
        let hmac = self.sign(crypto, hierarchy, tag, &Self::auth_parts(&claim))?;
        Ok(TpmtTicket {
            tag,
            hierarchy,
            digest: hmac.into(),
        })
    }

    /// Verify an AUTH ticket, including its expiration against `clock`
    pub fn verify_auth(
        &self,
        crypto: &dyn CryptoProvider,
        clock: &dyn Clock,
        ticket: &TpmtTicket,
        claim: AuthClaim<'_>,
    ) -> Result<()> {
        if !matches!(ticket.tag, TpmSt::AuthSigned | TpmSt::AuthSecret) {
            return Err(TpmError::policy(PolicyFault::TicketInvalid));
        }
        check_expiration(clock, claim.timeout)?;
        self.check(crypto, ticket, &Self::auth_parts(&claim))
    }

    fn auth_parts<'a>(claim: &AuthClaim<'a>) -> [&'a [u8]; 4] {
        [
            claim.timeout.as_bytes(),
            claim.cp_hash,
            claim.policy_ref,
            claim.auth_name,
        ]
    }
}

/// Fail with `TicketExpired` once `timeout` has passed or the TPM was reset
pub fn check_expiration(clock: &dyn Clock, timeout: &Tpm2bTimeout) -> Result<()> {
    let Some((expires_at, reset_count)) = timeout.expiration() else {
        return Ok(());
    };
    if reset_count != clock.reset_count() || clock.now() > expires_at {
        return Err(TpmError::policy(PolicyFault::TicketExpired));
    }
    Ok(())
}
