// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Drive the TPM 2.0 engine in-process
//!
//! Usage:
//!   tpm2-engine-demo trial --auth-value --pcr 7
//!   tpm2-engine-demo authorize --policy-ref release-1
//!   tpm2-engine-demo exec 80010000000c0000017600...

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use p256::ecdsa::SigningKey;
use tracing::info;

use tpm2_engine::soft::{digest, ecc_public_key, ecdsa_sign, ObjectTable};
use tpm2_engine::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON engine configuration
    #[arg(short, long, env = "TPM2_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute a policy digest through a trial session
    Trial {
        /// Include PolicyAuthValue
        #[arg(long)]
        auth_value: bool,
        /// PCR indices to include in a PolicyPCR assertion (SHA-256 bank)
        #[arg(long = "pcr")]
        pcrs: Vec<u32>,
    },
    /// Approve a PolicyAuthValue policy with a fresh key and satisfy it via PolicyAuthorize
    Authorize {
        #[arg(long, default_value = "")]
        policy_ref: String,
    },
    /// Execute one hex-encoded command envelope and print the response
    Exec { command: String },
}

/// Execute one typed command through its wire envelope
fn call<P: Parameters, R: Parameters>(
    tpm: &mut Tpm,
    command_code: TpmCc,
    args: &P,
    sessions: &[TpmsAuthCommand],
) -> Result<R> {
    let command = TpmCommand::build(command_code, args, sessions);
    let response = TpmResponse::parse(&tpm.execute(&command))?;
    response
        .decode()
        .with_context(|| format!("{command_code:?} failed"))
}

fn start_session(tpm: &mut Tpm, session_type: TpmSe) -> Result<u32> {
    let nonce = soft::SoftCrypto.random(16);
    let args = StartAuthSessionIn::unbound(session_type, TpmAlgId::Sha256, nonce);
    let out: StartAuthSessionOut = call(tpm, TpmCc::StartAuthSession, &args, &[])?;
    Ok(out.session_handle)
}

fn policy_digest(tpm: &mut Tpm, session: u32) -> Result<Vec<u8>> {
    let out: PolicyGetDigestOut = call(
        tpm,
        TpmCc::PolicyGetDigest,
        &PolicyGetDigestIn {
            policy_session: session,
        },
        &[],
    )?;
    Ok(out.policy_digest.buffer)
}

fn trial(tpm: &mut Tpm, auth_value: bool, pcrs: &[u32]) -> Result<Vec<u8>> {
    if !auth_value && pcrs.is_empty() {
        bail!("nothing to assert: pass --auth-value and/or --pcr");
    }
    let session = start_session(tpm, TpmSe::Trial)?;
    if auth_value {
        let _: NoResponse = call(
            tpm,
            TpmCc::PolicyAuthValue,
            &PolicyAuthValueIn {
                policy_session: session,
            },
            &[],
        )?;
    }
    if !pcrs.is_empty() {
        let _: NoResponse = call(
            tpm,
            TpmCc::PolicyPcr,
            &PolicyPcrIn {
                policy_session: session,
                pcr_digest: Tpm2bDigest::empty(),
                pcrs: TpmlPcrSelection::single(TpmAlgId::Sha256, pcrs),
            },
            &[],
        )?;
    }
    let digest = policy_digest(tpm, session)?;
    let _: NoResponse = call(
        tpm,
        TpmCc::FlushContext,
        &FlushContextIn {
            flush_handle: session,
        },
        &[],
    )?;
    Ok(digest)
}

fn authorize(config: TpmConfig, policy_ref: &str) -> Result<()> {
    let objects = ObjectTable::new();
    let mut tpm = Tpm::new(config)?.with_objects(objects.clone());

    let key = SigningKey::random(&mut rand::thread_rng());
    let signer = objects.load_key(ecc_public_key(key.verifying_key()), tpm_rh::OWNER)?;
    info!("signing key 0x{:08x}, name {}", signer.handle, hex::encode(signer.name.as_bytes()));

    let approved = trial(&mut tpm, true, &[])?;
    info!("approved policy {}", hex::encode(&approved));

    let policy_ref = policy_ref.as_bytes();
    let approval = digest(TpmAlgId::Sha256, &[approved.as_slice(), policy_ref])?;
    let verified: VerifySignatureOut = call(
        &mut tpm,
        TpmCc::VerifySignature,
        &VerifySignatureIn {
            key_handle: signer.handle,
            digest: approval.clone().into(),
            signature: ecdsa_sign(&key, &approval)?,
        },
        &[],
    )?;

    let session = start_session(&mut tpm, TpmSe::Policy)?;
    let _: NoResponse = call(
        &mut tpm,
        TpmCc::PolicyAuthValue,
        &PolicyAuthValueIn {
            policy_session: session,
        },
        &[],
    )?;
    let _: NoResponse = call(
        &mut tpm,
        TpmCc::PolicyAuthorize,
        &PolicyAuthorizeIn {
            policy_session: session,
            approved_policy: approved.into(),
            policy_ref: policy_ref.into(),
            key_sign: signer.name.clone(),
            check_ticket: verified.validation,
        },
        &[],
    )?;
    println!("{}", hex::encode(policy_digest(&mut tpm, session)?));
    Ok(())
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TpmConfig::load(path)?,
        None => TpmConfig::default(),
    };

    match args.command {
        Command::Trial { auth_value, pcrs } => {
            let mut tpm = Tpm::new(config)?;
            println!("{}", hex::encode(trial(&mut tpm, auth_value, &pcrs)?));
        }
        Command::Authorize { policy_ref } => authorize(config, &policy_ref)?,
        Command::Exec { command } => {
            let command = hex::decode(command.trim()).context("command is not valid hex")?;
            let mut tpm = Tpm::new(config)?;
            let response = tpm.execute(&command);
            let parsed = TpmResponse::parse(&response)?;
            info!("response code 0x{:03x}", parsed.response_code);
            println!("{}", hex::encode(response));
        }
    }
    Ok(())
}
