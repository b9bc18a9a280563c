// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command-processing core
//!
//! This crate executes TPM 2.0 command envelopes in-process: it frames and
//! unmarshals requests, runs the session and policy commands against an
//! explicit [`Tpm`] context and marshals the responses byte-for-byte.
//!
//! ## Features
//!
//! - **Policy sessions**: PolicyAuthValue, PolicyPassword, PolicyCommandCode,
//!   PolicyPCR, PolicyAuthorize, PolicySigned and PolicyTicket, with trial
//!   sessions for computing policy digests offline
//! - **Tickets**: VERIFIED and AUTH tickets bound to per-hierarchy proofs
//! - **Pluggable collaborators**: crypto, PCR banks, handle resolution, clock
//!   and command metadata sit behind traits, with software implementations
//!   in [`soft`]
//!
//! ## Example
//!
//! ```
//! use tpm2_engine::*;
//!
//! let mut tpm = Tpm::new(TpmConfig::default())?;
//! let args = StartAuthSessionIn::unbound(TpmSe::Trial, TpmAlgId::Sha256, vec![0; 16]);
//! let session: StartAuthSessionOut = tpm.run(TpmCc::StartAuthSession, &args, &[])?;
//! let policy = PolicyAuthValueIn { policy_session: session.session_handle };
//! let _: NoResponse = tpm.run(TpmCc::PolicyAuthValue, &policy, &[])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod collab;
mod command;
mod commands;
mod config;
mod constants;
mod dispatch;
mod envelope;
mod error;
mod framer;
mod marshal;
mod policy;
mod session;
pub mod soft;
mod ticket;
mod types;

pub use collab::*;
pub use command::*;
pub use config::{HierarchyConfig, TpmConfig};
pub use constants::*;
pub use dispatch::{command_info, commands, CommandInfo, SharedTpm, Tpm};
pub use error::{CommandError, ErrorSite, Fault, PolicyFault, Resource, TpmError};
pub use types::*;

pub use envelope::{error_response, parse_header, split_request, Request, RequestHeader};
pub use envelope::{TpmCommand, TpmResponse};
pub use framer::{marshal_response, unmarshal_request};
pub use marshal::{Marshal, ReadBuffer, Unmarshal, WriteBuffer};
pub use policy::{evaluate, policy_update, PolicyAssertion, PolicyContext, PolicyOutcome};
pub use session::{PcrSnapshot, Session, SessionParams, SessionTable};
pub use ticket::{check_expiration, AuthClaim, TicketAuthority, PROOF_HASH};
