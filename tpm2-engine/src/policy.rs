// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy engine
//!
//! Every assertion is applied in two steps: [`evaluate`] validates it against
//! the session and TPM state and computes the complete [`PolicyChange`]
//! without touching the session, then [`apply`] commits that change. A failed
//! assertion therefore leaves the session exactly as it was.
//!
//! Trial sessions skip the proof checks (PCR comparison, signatures, tickets,
//! nonces and expirations) but still extend the digest. The approved-policy
//! comparison of PolicyAuthorize is never skipped.

use tracing::debug;

use super::collab::*;
use super::command::*;
use super::constants::*;
use super::error::{Fault, PolicyFault, Result, TpmError};
use super::marshal::Marshal;
use super::session::{PcrSnapshot, PolicyChange, Session};
use super::ticket::{AuthClaim, TicketAuthority};
use super::types::*;

/// Services an assertion may consult
#[derive(Clone, Copy)]
pub struct PolicyContext<'a> {
    pub crypto: &'a dyn CryptoProvider,
    pub pcrs: &'a dyn PcrBank,
    pub clock: &'a dyn Clock,
    pub commands: &'a dyn CommandMetadata,
    pub tickets: &'a TicketAuthority,
}

/// One policy assertion with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAssertion {
    AuthValue,
    Password,
    CommandCode {
        code: u32,
    },
    Pcr {
        pcr_digest: Tpm2bDigest,
        pcrs: TpmlPcrSelection,
    },
    Authorize {
        approved_policy: Tpm2bDigest,
        policy_ref: Tpm2bNonce,
        key_sign: Tpm2bName,
        check_ticket: TpmtTicket,
    },
    Ticket {
        timeout: Tpm2bTimeout,
        cp_hash_a: Tpm2bDigest,
        policy_ref: Tpm2bNonce,
        auth_name: Tpm2bName,
        ticket: TpmtTicket,
    },
    Signed {
        auth_object: Entity,
        nonce_tpm: Tpm2bNonce,
        cp_hash_a: Tpm2bDigest,
        policy_ref: Tpm2bNonce,
        expiration: i32,
        auth: TpmtSignature,
    },
}

/// Output of an applied assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Done,
    Signed {
        timeout: Tpm2bTimeout,
        ticket: TpmtTicket,
    },
}

impl PolicyAssertion {
    pub fn command_code(&self) -> TpmCc {
        match self {
            PolicyAssertion::AuthValue => TpmCc::PolicyAuthValue,
            PolicyAssertion::Password => TpmCc::PolicyPassword,
            PolicyAssertion::CommandCode { .. } => TpmCc::PolicyCommandCode,
            PolicyAssertion::Pcr { .. } => TpmCc::PolicyPcr,
            PolicyAssertion::Authorize { .. } => TpmCc::PolicyAuthorize,
            PolicyAssertion::Ticket { .. } => TpmCc::PolicyTicket,
            PolicyAssertion::Signed { .. } => TpmCc::PolicySigned,
        }
    }

    /// 1-based position of the policy session in the command's handle area
    fn session_index(&self) -> u8 {
        match self {
            PolicyAssertion::Signed { .. } => 2,
            _ => 1,
        }
    }
}

impl From<PolicyPcrIn> for PolicyAssertion {
    fn from(args: PolicyPcrIn) -> Self {
        PolicyAssertion::Pcr {
            pcr_digest: args.pcr_digest,
            pcrs: args.pcrs,
        }
    }
}

impl From<PolicyAuthorizeIn> for PolicyAssertion {
    fn from(args: PolicyAuthorizeIn) -> Self {
        PolicyAssertion::Authorize {
            approved_policy: args.approved_policy,
            policy_ref: args.policy_ref,
            key_sign: args.key_sign,
            check_ticket: args.check_ticket,
        }
    }
}

impl From<PolicyTicketIn> for PolicyAssertion {
    fn from(args: PolicyTicketIn) -> Self {
        PolicyAssertion::Ticket {
            timeout: args.timeout,
            cp_hash_a: args.cp_hash_a,
            policy_ref: args.policy_ref,
            auth_name: args.auth_name,
            ticket: args.ticket,
        }
    }
}

/// `d = H(d || cc || extra...)`
fn extend(
    ctx: &PolicyContext<'_>,
    alg: TpmAlgId,
    digest: &[u8],
    cc: TpmCc,
    extra: &[&[u8]],
) -> Result<Vec<u8>> {
    let cc = cc.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(extra.len() + 2);
    parts.push(digest);
    parts.push(&cc);
    parts.extend_from_slice(extra);
    ctx.crypto.hash(alg, &parts)
}

/// PolicyUpdate: `d = H(d || cc || name)`, then `d = H(d || policyRef)`
pub fn policy_update(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    digest: &[u8],
    cc: TpmCc,
    name: &[u8],
    policy_ref: &[u8],
) -> Result<Vec<u8>> {
    let digest = crypto.hash(alg, &[digest, &cc.to_u32().to_be_bytes(), name])?;
    crypto.hash(alg, &[digest.as_slice(), policy_ref])
}

/// Bind a cpHash to the session, refusing to replace a different one
fn bind_cp_hash(session: &Session, cp_hash: &[u8], index: u8) -> Result<Option<Vec<u8>>, Fault> {
    if cp_hash.is_empty() {
        return Ok(None);
    }
    match session.cp_hash() {
        Some(bound) if bound != cp_hash => {
            Err(TpmError::policy(PolicyFault::CpHashMismatch).at_parameter(index))
        }
        _ => Ok(Some(cp_hash.to_vec())),
    }
}

/// Validate `assertion` against `session` and compute its effect
pub fn evaluate(
    ctx: &PolicyContext<'_>,
    session: &Session,
    assertion: &PolicyAssertion,
) -> Result<(PolicyChange, PolicyOutcome), Fault> {
    if !session.is_policy() {
        return Err(TpmError::SessionStateInvalid.at_handle(assertion.session_index()));
    }
    let alg = session.hash_alg;
    let current = session.policy_digest();
    let trial = session.is_trial();

    let change = match assertion {
        PolicyAssertion::AuthValue | PolicyAssertion::Password => {
            let password = matches!(assertion, PolicyAssertion::Password);
            PolicyChange {
                // PolicyPassword shares the PolicyAuthValue marker
                digest: extend(ctx, alg, current, TpmCc::PolicyAuthValue, &[])?,
                auth_value_needed: Some(!password),
                password_needed: Some(password),
                ..Default::default()
            }
        }
        PolicyAssertion::CommandCode { code } => {
            if !ctx.commands.is_implemented(*code) {
                return Err(TpmError::policy(PolicyFault::CommandCode).at_parameter(1));
            }
            if session.command_code().is_some_and(|bound| bound != *code) {
                return Err(TpmError::SessionStateInvalid.at_parameter(1));
            }
            PolicyChange {
                digest: extend(ctx, alg, current, TpmCc::PolicyCommandCode, &[&code.to_be_bytes()])?,
                command_code: Some(*code),
                ..Default::default()
            }
        }
        PolicyAssertion::Pcr { pcr_digest, pcrs } => {
            let update_counter = ctx.pcrs.update_counter();
            if !trial {
                if let Some(snapshot) = session.pcr_snapshot() {
                    if snapshot.update_counter != update_counter {
                        return Err(TpmError::policy(PolicyFault::PcrChanged).into());
                    }
                }
            }
            let used = if trial && !pcr_digest.is_empty() {
                pcr_digest.buffer.clone()
            } else {
                let value = ctx.pcrs.current_digest(pcrs, alg).map_err(|e| e.at_parameter(2))?;
                if !trial && !pcr_digest.is_empty() && pcr_digest.as_bytes() != value.as_slice() {
                    return Err(TpmError::policy(PolicyFault::PcrMismatch).at_parameter(1));
                }
                value
            };
            PolicyChange {
                digest: extend(ctx, alg, current, TpmCc::PolicyPcr, &[pcrs.to_bytes().as_slice(), &used])?,
                pcr_snapshot: Some(PcrSnapshot {
                    selection: pcrs.clone(),
                    update_counter,
                }),
                ..Default::default()
            }
        }
        PolicyAssertion::Authorize {
            approved_policy,
            policy_ref,
            key_sign,
            check_ticket,
        } => {
            if approved_policy.as_bytes() != current {
                return Err(TpmError::policy(PolicyFault::ApprovedPolicyMismatch).at_parameter(1));
            }
            let name_alg = key_sign
                .name_alg()
                .filter(|alg| alg.is_hash())
                .ok_or(TpmError::Value.at_parameter(3))?;
            if !trial {
                let approved = ctx
                    .crypto
                    .hash(name_alg, &[approved_policy.as_bytes(), policy_ref.as_bytes()])
                    .map_err(|e| e.at_parameter(3))?;
                ctx.tickets
                    .verify_verified(ctx.crypto, check_ticket, &approved, key_sign.as_bytes())
                    .map_err(|e| e.at_parameter(4))?;
            }
            let zero = vec![0u8; alg.digest_size()];
            PolicyChange {
                digest: policy_update(
                    ctx.crypto,
                    alg,
                    &zero,
                    TpmCc::PolicyAuthorize,
                    key_sign.as_bytes(),
                    policy_ref.as_bytes(),
                )?,
                ..Default::default()
            }
        }
        PolicyAssertion::Ticket {
            timeout,
            cp_hash_a,
            policy_ref,
            auth_name,
            ticket,
        } => {
            let cc = match ticket.tag {
                TpmSt::AuthSigned => TpmCc::PolicySigned,
                TpmSt::AuthSecret => TpmCc::PolicySecret,
                _ => return Err(TpmError::policy(PolicyFault::TicketInvalid).at_parameter(5)),
            };
            let cp_hash = bind_cp_hash(session, cp_hash_a.as_bytes(), 2)?;
            if !trial {
                let claim = AuthClaim {
                    timeout,
                    cp_hash: cp_hash_a.as_bytes(),
                    policy_ref: policy_ref.as_bytes(),
                    auth_name: auth_name.as_bytes(),
                };
                ctx.tickets
                    .verify_auth(ctx.crypto, ctx.clock, ticket, claim)
                    .map_err(|e| match e {
                        TpmError::PolicyFailure(PolicyFault::TicketExpired) => e.at_parameter(1),
                        _ => e.at_parameter(5),
                    })?;
            }
            PolicyChange {
                digest: policy_update(
                    ctx.crypto,
                    alg,
                    current,
                    cc,
                    auth_name.as_bytes(),
                    policy_ref.as_bytes(),
                )?,
                cp_hash,
                ..Default::default()
            }
        }
        PolicyAssertion::Signed {
            auth_object,
            nonce_tpm,
            cp_hash_a,
            policy_ref,
            expiration,
            auth,
        } => {
            if !trial {
                if !nonce_tpm.is_empty() && nonce_tpm.as_bytes() != session.nonce_tpm.as_slice() {
                    return Err(TpmError::policy(PolicyFault::NonceMismatch).at_parameter(1));
                }
                if *expiration != 0 {
                    let limit = u64::from(expiration.unsigned_abs()) * 1000;
                    if ctx.clock.now().saturating_sub(session.start_time) > limit {
                        return Err(TpmError::policy(PolicyFault::TicketExpired).at_parameter(4));
                    }
                }
            }
            let cp_hash = bind_cp_hash(session, cp_hash_a.as_bytes(), 2)?;
            if !trial {
                let a_hash_parts: [&[u8]; 4] = [
                    nonce_tpm.as_bytes(),
                    &expiration.to_be_bytes(),
                    cp_hash_a.as_bytes(),
                    policy_ref.as_bytes(),
                ];
                verify_signed_authorization(ctx, auth_object, &a_hash_parts, auth)?;
            }
            PolicyChange {
                digest: policy_update(
                    ctx.crypto,
                    alg,
                    current,
                    TpmCc::PolicySigned,
                    auth_object.name.as_bytes(),
                    policy_ref.as_bytes(),
                )?,
                cp_hash,
                ..Default::default()
            }
        }
    };

    let outcome = match assertion {
        PolicyAssertion::Signed {
            auth_object,
            nonce_tpm,
            cp_hash_a,
            policy_ref,
            expiration,
            ..
        } if !trial && *expiration < 0 && !nonce_tpm.is_empty() => {
            let expires_at =
                session.start_time + u64::from(expiration.unsigned_abs()) * 1000;
            let timeout = Tpm2bTimeout::new(expires_at, ctx.clock.reset_count());
            let claim = AuthClaim {
                timeout: &timeout,
                cp_hash: cp_hash_a.as_bytes(),
                policy_ref: policy_ref.as_bytes(),
                auth_name: auth_object.name.as_bytes(),
            };
            let ticket = ctx
                .tickets
                .issue_auth(ctx.crypto, TpmSt::AuthSigned, auth_object.hierarchy, claim)?;
            PolicyOutcome::Signed { timeout, ticket }
        }
        PolicyAssertion::Signed { .. } => PolicyOutcome::Signed {
            timeout: Tpm2bTimeout::empty(),
            ticket: TpmtTicket::null(TpmSt::AuthSigned),
        },
        _ => PolicyOutcome::Done,
    };
    Ok((change, outcome))
}

/// Check the signature of a PolicySigned authorization:
/// `aHash = H_nameAlg(nonceTPM || expiration || cpHashA || policyRef)`
fn verify_signed_authorization(
    ctx: &PolicyContext<'_>,
    auth_object: &Entity,
    a_hash_parts: &[&[u8]],
    auth: &TpmtSignature,
) -> Result<(), Fault> {
    let public = auth_object
        .public
        .as_ref()
        .ok_or(TpmError::HandleNotFound.at_handle(1))?;
    let hash_alg = auth.hash_alg().ok_or(TpmError::Value.at_parameter(5))?;
    let a_hash = ctx.crypto.hash(hash_alg, a_hash_parts)?;
    if !ctx.crypto.verify_signature(public, &a_hash, auth)? {
        return Err(TpmError::policy(PolicyFault::SignatureInvalid).at_parameter(5));
    }
    Ok(())
}

/// Apply `assertion` to `session`; on error the session is unchanged
pub fn apply(
    ctx: &PolicyContext<'_>,
    session: &mut Session,
    assertion: &PolicyAssertion,
) -> Result<PolicyOutcome, Fault> {
    let (change, outcome) = evaluate(ctx, session, assertion)?;
    session.commit(change);
    debug!(
        "{:?} applied to session 0x{:08x}, digest {}",
        assertion.command_code(),
        session.handle,
        hex::encode(session.policy_digest())
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TpmConfig;
    use crate::error::ErrorSite;
    use crate::session::{SessionParams, SessionTable};
    use crate::soft::*;
    use p256::ecdsa::SigningKey;

    struct Fixture {
        pcrs: SoftPcrBank,
        clock: ManualClock,
        commands: BuiltinCommands,
        tickets: TicketAuthority,
        objects: ObjectTable,
        sessions: SessionTable,
    }

    impl Fixture {
        fn new() -> Self {
            let config = TpmConfig {
                proof_seed: b"policy tests".to_vec(),
                ..Default::default()
            };
            Self {
                pcrs: SoftPcrBank::new(),
                clock: ManualClock::new(),
                commands: BuiltinCommands::new(),
                tickets: TicketAuthority::new(&config, &SoftCrypto).unwrap(),
                objects: ObjectTable::new(),
                sessions: SessionTable::new(8, false),
            }
        }

        fn start(&mut self, session_type: TpmSe) -> u32 {
            self.sessions
                .start(SessionParams {
                    session_type,
                    hash_alg: TpmAlgId::Sha256,
                    bound_entity: None,
                    nonce_caller: vec![0; 16],
                    nonce_tpm: vec![0x5A; 32],
                    start_time: self.clock.now(),
                })
                .unwrap()
        }

        fn apply(&mut self, handle: u32, assertion: PolicyAssertion) -> Result<PolicyOutcome, Fault> {
            let ctx = PolicyContext {
                crypto: &SoftCrypto,
                pcrs: &self.pcrs,
                clock: &self.clock,
                commands: &self.commands,
                tickets: &self.tickets,
            };
            let session = self.sessions.get_mut(handle).map_err(Fault::from)?;
            apply(&ctx, session, &assertion)
        }

        fn digest(&self, handle: u32) -> String {
            hex::encode(self.sessions.get(handle).unwrap().policy_digest())
        }
    }

    fn pcr7(pcr_digest: Vec<u8>) -> PolicyAssertion {
        PolicyAssertion::Pcr {
            pcr_digest: pcr_digest.into(),
            pcrs: TpmlPcrSelection::single(TpmAlgId::Sha256, &[7]),
        }
    }

    const ZERO_PCR7_DIGEST: &str = "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925";

    #[test]
    fn test_auth_value_digest() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Trial);
        fx.apply(handle, PolicyAssertion::AuthValue).unwrap();
        assert_eq!(
            fx.digest(handle),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );
        assert!(fx.sessions.get(handle).unwrap().is_auth_value_needed());
    }

    #[test]
    fn test_password_shares_auth_value_digest() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        fx.apply(handle, PolicyAssertion::Password).unwrap();
        assert_eq!(
            fx.digest(handle),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );
        let session = fx.sessions.get(handle).unwrap();
        assert!(session.is_password_needed());
        assert!(!session.is_auth_value_needed());
    }

    #[test]
    fn test_pcr_digest_is_order_sensitive() {
        let expected_pcr = hex::decode(ZERO_PCR7_DIGEST).unwrap();

        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        fx.apply(handle, PolicyAssertion::AuthValue).unwrap();
        fx.apply(handle, pcr7(expected_pcr.clone())).unwrap();
        assert_eq!(
            fx.digest(handle),
            "31caf4ac6c9cd8fcedf4e8e3b322389ba5b52977529db8edd6e51b287e8c3b0c"
        );

        let reversed = fx.start(TpmSe::Policy);
        fx.apply(reversed, pcr7(expected_pcr)).unwrap();
        fx.apply(reversed, PolicyAssertion::AuthValue).unwrap();
        assert_eq!(
            fx.digest(reversed),
            "b8db92fae7c1e0c588e7352d2fc10f27c7b384e32f706a520cb10bf7ffee8970"
        );
    }

    #[test]
    fn test_pcr_mismatch_leaves_session_untouched() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        let err = fx.apply(handle, pcr7(vec![0xAB; 32])).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::PcrMismatch));
        assert_eq!(err.site, Some(ErrorSite::Parameter(1)));
        assert_eq!(fx.digest(handle), "00".repeat(32));
        assert!(fx.sessions.get(handle).unwrap().pcr_snapshot().is_none());

        // A trial session records the caller's digest without comparing
        let trial = fx.start(TpmSe::Trial);
        fx.apply(trial, pcr7(vec![0xAB; 32])).unwrap();
    }

    #[test]
    fn test_pcr_empty_digest_uses_current_values() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        fx.apply(handle, pcr7(Vec::new())).unwrap();
        assert_eq!(
            fx.digest(handle),
            "8b5682d81b29435d08d79278150611dc7e5923b2fefcce684a09577b40130a8b"
        );
    }

    #[test]
    fn test_pcr_change_after_snapshot() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        fx.apply(handle, pcr7(Vec::new())).unwrap();
        fx.pcrs.extend(0, b"late measurement").unwrap();
        let before = fx.digest(handle);
        let err = fx.apply(handle, pcr7(Vec::new())).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::PcrChanged));
        assert_eq!(err.response_code(), 0x128);
        assert_eq!(fx.digest(handle), before);
    }

    #[test]
    fn test_command_code_is_set_once() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Policy);
        let code = TpmCc::PolicyGetDigest.to_u32();
        fx.apply(handle, PolicyAssertion::CommandCode { code }).unwrap();
        fx.apply(handle, PolicyAssertion::CommandCode { code }).unwrap();
        let err = fx
            .apply(handle, PolicyAssertion::CommandCode { code: TpmCc::FlushContext.to_u32() })
            .unwrap_err();
        assert_eq!(err.error, TpmError::SessionStateInvalid);
        assert_eq!(fx.sessions.get(handle).unwrap().command_code(), Some(code));

        let err = fx
            .apply(handle, PolicyAssertion::CommandCode { code: 0x1FF })
            .unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::CommandCode));
    }

    #[test]
    fn test_hmac_session_rejects_assertions() {
        let mut fx = Fixture::new();
        let handle = fx.start(TpmSe::Hmac);
        let err = fx.apply(handle, PolicyAssertion::AuthValue).unwrap_err();
        assert_eq!(err, TpmError::SessionStateInvalid.at_handle(1));
    }

    fn authorize(fx: &Fixture, key_name: &Tpm2bName, approved: &[u8]) -> PolicyAssertion {
        let policy_ref = b"release-1".to_vec();
        let approved_digest =
            digest(TpmAlgId::Sha256, &[approved, &policy_ref]).unwrap();
        let ticket = fx
            .tickets
            .issue_verified(&SoftCrypto, tpm_rh::OWNER, &approved_digest, key_name.as_bytes())
            .unwrap();
        PolicyAssertion::Authorize {
            approved_policy: approved.to_vec().into(),
            policy_ref: policy_ref.into(),
            key_sign: key_name.clone(),
            check_ticket: ticket,
        }
    }

    #[test]
    fn test_authorize_replaces_digest() {
        let mut fx = Fixture::new();
        let key = SigningKey::from_slice(&[3u8; 32]).unwrap();
        let signer = fx
            .objects
            .load_key(ecc_public_key(key.verifying_key()), tpm_rh::OWNER)
            .unwrap();

        let handle = fx.start(TpmSe::Policy);
        fx.apply(handle, PolicyAssertion::AuthValue).unwrap();
        let approved = fx.sessions.get(handle).unwrap().policy_digest().to_vec();
        fx.apply(handle, authorize(&fx, &signer.name, &approved)).unwrap();

        let expected = policy_update(
            &SoftCrypto,
            TpmAlgId::Sha256,
            &[0u8; 32],
            TpmCc::PolicyAuthorize,
            signer.name.as_bytes(),
            b"release-1",
        )
        .unwrap();
        assert_eq!(fx.digest(handle), hex::encode(expected));
    }

    #[test]
    fn test_authorize_requires_matching_policy_even_in_trial() {
        let mut fx = Fixture::new();
        let name = Tpm2bName::new(hex::decode(format!("000b{}", "11".repeat(32))).unwrap());
        for session_type in [TpmSe::Policy, TpmSe::Trial] {
            let handle = fx.start(session_type);
            // The ticket is valid, but for a different approved policy
            let assertion = authorize(&fx, &name, &[0x77; 32]);
            let err = fx.apply(handle, assertion).unwrap_err();
            assert_eq!(err.error, TpmError::policy(PolicyFault::ApprovedPolicyMismatch));
            assert_eq!(err.site, Some(ErrorSite::Parameter(1)));
        }
    }

    #[test]
    fn test_authorize_rejects_forged_ticket() {
        let mut fx = Fixture::new();
        let name = Tpm2bName::new(hex::decode(format!("000b{}", "22".repeat(32))).unwrap());
        let handle = fx.start(TpmSe::Policy);
        let mut assertion = authorize(&fx, &name, &[0u8; 32]);
        if let PolicyAssertion::Authorize { check_ticket, .. } = &mut assertion {
            check_ticket.digest.buffer[0] ^= 1;
        }
        let err = fx.apply(handle, assertion).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::TicketInvalid));
        assert_eq!(err.site, Some(ErrorSite::Parameter(4)));
    }

    fn signed(
        key: &SigningKey,
        auth_object: &Entity,
        nonce_tpm: &[u8],
        expiration: i32,
    ) -> PolicyAssertion {
        let a_hash = digest(
            TpmAlgId::Sha256,
            &[nonce_tpm, &expiration.to_be_bytes(), b"", b"ref"],
        )
        .unwrap();
        PolicyAssertion::Signed {
            auth_object: auth_object.clone(),
            nonce_tpm: nonce_tpm.to_vec().into(),
            cp_hash_a: Tpm2bDigest::empty(),
            policy_ref: b"ref".to_vec().into(),
            expiration,
            auth: ecdsa_sign(key, &a_hash).unwrap(),
        }
    }

    #[test]
    fn test_signed_ticket_replays_through_policy_ticket() {
        let mut fx = Fixture::new();
        let key = SigningKey::from_slice(&[5u8; 32]).unwrap();
        let signer = fx
            .objects
            .load_key(ecc_public_key(key.verifying_key()), tpm_rh::OWNER)
            .unwrap();

        let first = fx.start(TpmSe::Policy);
        let outcome = fx.apply(first, signed(&key, &signer, &[0x5A; 32], -60)).unwrap();
        let PolicyOutcome::Signed { timeout, ticket } = outcome else {
            panic!("PolicySigned must produce an outcome");
        };
        assert_eq!(ticket.tag, TpmSt::AuthSigned);
        assert_eq!(timeout.expiration(), Some((60_000, 0)));

        let second = fx.start(TpmSe::Policy);
        let replay = PolicyAssertion::Ticket {
            timeout: timeout.clone(),
            cp_hash_a: Tpm2bDigest::empty(),
            policy_ref: b"ref".to_vec().into(),
            auth_name: signer.name.clone(),
            ticket: ticket.clone(),
        };
        fx.apply(second, replay.clone()).unwrap();
        assert_eq!(fx.digest(first), fx.digest(second));

        // Once the clock passes the timeout the ticket is refused
        fx.clock.set(60_001);
        let third = fx.start(TpmSe::Policy);
        let err = fx.apply(third, replay).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::TicketExpired));
    }

    #[test]
    fn test_signed_rejects_bad_signature_and_nonce() {
        let mut fx = Fixture::new();
        let key = SigningKey::from_slice(&[5u8; 32]).unwrap();
        let other = SigningKey::from_slice(&[6u8; 32]).unwrap();
        let signer = fx
            .objects
            .load_key(ecc_public_key(key.verifying_key()), tpm_rh::OWNER)
            .unwrap();
        let handle = fx.start(TpmSe::Policy);

        let err = fx.apply(handle, signed(&other, &signer, &[], 0)).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::SignatureInvalid));
        assert_eq!(err.site, Some(ErrorSite::Parameter(5)));

        let err = fx.apply(handle, signed(&key, &signer, &[1; 32], 0)).unwrap_err();
        assert_eq!(err.error, TpmError::policy(PolicyFault::NonceMismatch));
        assert_eq!(fx.digest(handle), "00".repeat(32));

        // Without a nonce no ticket is issued
        let outcome = fx.apply(handle, signed(&key, &signer, &[], -10)).unwrap();
        assert_eq!(
            outcome,
            PolicyOutcome::Signed {
                timeout: Tpm2bTimeout::empty(),
                ticket: TpmtTicket::null(TpmSt::AuthSigned),
            }
        );
    }
}
