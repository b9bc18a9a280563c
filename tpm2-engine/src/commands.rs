// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! Each function receives its unmarshaled request and returns the response
//! the framer marshals. Errors carry the handle or parameter they belong to.

use tracing::debug;

use super::command::*;
use super::constants::*;
use super::dispatch::Tpm;
use super::error::{Fault, PolicyFault, TpmError};
use super::policy::{self, PolicyAssertion, PolicyContext, PolicyOutcome};
use super::session::SessionParams;
use super::types::*;

impl Tpm {
    /// Run one assertion against the policy session at handle position `index`
    fn assert_policy(
        &mut self,
        handle: u32,
        index: u8,
        assertion: PolicyAssertion,
    ) -> Result<PolicyOutcome, Fault> {
        let ctx = PolicyContext {
            crypto: self.crypto.as_ref(),
            pcrs: self.pcrs.as_ref(),
            clock: self.clock.as_ref(),
            commands: self.commands.as_ref(),
            tickets: &self.tickets,
        };
        let session = self
            .sessions
            .get_mut(handle)
            .map_err(|e| e.at_handle(index))?;
        policy::apply(&ctx, session, &assertion)
    }

    // ==================== Sessions ====================

    pub(crate) fn start_auth_session(
        &mut self,
        args: StartAuthSessionIn,
    ) -> Result<StartAuthSessionOut, Fault> {
        // Salted sessions are not supported
        if args.tpm_key != tpm_rh::NULL {
            return Err(TpmError::Value.at_handle(1));
        }
        if !args.encrypted_salt.is_empty() {
            return Err(TpmError::Value.at_parameter(2));
        }

        let bound_entity = if args.bind == tpm_rh::NULL {
            None
        } else {
            let entity = self
                .objects
                .resolve(args.bind)
                .ok_or(TpmError::HandleNotFound.at_handle(2))?;
            Some(entity.name)
        };

        let hash_alg = args.auth_hash.0;
        if !matches!(hash_alg, TpmAlgId::Sha256 | TpmAlgId::Sha384 | TpmAlgId::Sha512) {
            return Err(TpmError::Value.at_parameter(5));
        }
        let nonce_len = args.nonce_caller.len();
        if !(MIN_NONCE_SIZE..=hash_alg.digest_size()).contains(&nonce_len) {
            return Err(TpmError::Size.at_parameter(1));
        }

        let nonce_tpm = self.crypto.random(hash_alg.digest_size());
        let session_handle = self.sessions.start(SessionParams {
            session_type: args.session_type,
            hash_alg,
            bound_entity,
            nonce_caller: args.nonce_caller.buffer,
            nonce_tpm: nonce_tpm.clone(),
            start_time: self.clock.now(),
        })?;
        Ok(StartAuthSessionOut {
            session_handle,
            nonce_tpm: nonce_tpm.into(),
        })
    }

    pub(crate) fn flush_context(&mut self, args: FlushContextIn) -> Result<NoResponse, Fault> {
        match TpmHt::of(args.flush_handle) {
            Some(TpmHt::HmacSession | TpmHt::PolicySession) => {
                self.sessions
                    .flush(args.flush_handle)
                    .map_err(|e| e.at_parameter(1))?;
                Ok(NoResponse {})
            }
            _ => Err(TpmError::Value.at_parameter(1)),
        }
    }

    // ==================== Policy assertions ====================

    pub(crate) fn policy_auth_value(&mut self, args: PolicyAuthValueIn) -> Result<NoResponse, Fault> {
        self.assert_policy(args.policy_session, 1, PolicyAssertion::AuthValue)?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_password(&mut self, args: PolicyPasswordIn) -> Result<NoResponse, Fault> {
        self.assert_policy(args.policy_session, 1, PolicyAssertion::Password)?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_command_code(
        &mut self,
        args: PolicyCommandCodeIn,
    ) -> Result<NoResponse, Fault> {
        let assertion = PolicyAssertion::CommandCode { code: args.code };
        self.assert_policy(args.policy_session, 1, assertion)?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_pcr(&mut self, args: PolicyPcrIn) -> Result<NoResponse, Fault> {
        let handle = args.policy_session;
        self.assert_policy(handle, 1, args.into())?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_authorize(&mut self, args: PolicyAuthorizeIn) -> Result<NoResponse, Fault> {
        let handle = args.policy_session;
        self.assert_policy(handle, 1, args.into())?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_ticket(&mut self, args: PolicyTicketIn) -> Result<NoResponse, Fault> {
        let handle = args.policy_session;
        self.assert_policy(handle, 1, args.into())?;
        Ok(NoResponse {})
    }

    pub(crate) fn policy_signed(&mut self, args: PolicySignedIn) -> Result<PolicySignedOut, Fault> {
        let auth_object = self
            .objects
            .resolve(args.auth_object)
            .ok_or(TpmError::HandleNotFound.at_handle(1))?;
        let assertion = PolicyAssertion::Signed {
            auth_object,
            nonce_tpm: args.nonce_tpm,
            cp_hash_a: args.cp_hash_a,
            policy_ref: args.policy_ref,
            expiration: args.expiration,
            auth: args.auth,
        };
        match self.assert_policy(args.policy_session, 2, assertion)? {
            PolicyOutcome::Signed { timeout, ticket } => Ok(PolicySignedOut {
                timeout,
                policy_ticket: ticket,
            }),
            PolicyOutcome::Done => Err(TpmError::Failure.into()),
        }
    }

    pub(crate) fn policy_get_digest(
        &mut self,
        args: PolicyGetDigestIn,
    ) -> Result<PolicyGetDigestOut, Fault> {
        let session = self
            .sessions
            .get(args.policy_session)
            .map_err(|e| e.at_handle(1))?;
        if !session.is_policy() {
            return Err(TpmError::SessionStateInvalid.at_handle(1));
        }
        Ok(PolicyGetDigestOut {
            policy_digest: session.policy_digest().to_vec().into(),
        })
    }

    // ==================== Signatures ====================

    pub(crate) fn verify_signature(
        &mut self,
        args: VerifySignatureIn,
    ) -> Result<VerifySignatureOut, Fault> {
        let key = self
            .objects
            .resolve(args.key_handle)
            .ok_or(TpmError::HandleNotFound.at_handle(1))?;
        let public = key.public.as_ref().ok_or(TpmError::Value.at_handle(1))?;
        if args.signature.hash_alg().is_none() {
            return Err(TpmError::Value.at_parameter(2));
        }
        let valid = self
            .crypto
            .verify_signature(public, args.digest.as_bytes(), &args.signature)
            .map_err(|e| e.at_parameter(2))?;
        if !valid {
            debug!("signature by 0x{:08x} did not verify", args.key_handle);
            return Err(TpmError::policy(PolicyFault::SignatureInvalid).at_parameter(2));
        }
        let validation = self.tickets.issue_verified(
            self.crypto.as_ref(),
            key.hierarchy,
            args.digest.as_bytes(),
            key.name.as_bytes(),
        )?;
        Ok(VerifySignatureOut { validation })
    }
}
