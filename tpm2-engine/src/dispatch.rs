// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command dispatch and the TPM context
//!
//! [`Tpm`] owns everything a command may touch: the session table, the ticket
//! authority, the collaborators and the response scratch buffer. Independent
//! instances never share state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::collab::*;
use super::command::*;
use super::config::TpmConfig;
use super::constants::*;
use super::envelope::*;
use super::error::{CommandError, Fault, Result, TpmError};
use super::framer;
use super::marshal::WriteBuffer;
use super::session::SessionTable;
use super::soft::{BuiltinCommands, ObjectTable, SoftCrypto, SoftPcrBank, SystemClock};
use super::ticket::TicketAuthority;
use super::types::{TpmsAuthCommand, TpmsAuthResponse};

type Handler = fn(&mut Tpm, TpmSt, &[u32], &[u8], &mut WriteBuffer, usize) -> Result<usize, Fault>;

/// Static facts about one implemented command
pub struct CommandInfo {
    pub code: TpmCc,
    pub name: &'static str,
    /// Number of handles in the request handle area
    pub handles: usize,
    handler: Handler,
}

impl fmt::Debug for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandInfo")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("handles", &self.handles)
            .finish()
    }
}

macro_rules! command {
    ($cc:ident, $input:ty => $output:ty, $method:ident) => {
        CommandInfo {
            code: TpmCc::$cc,
            name: stringify!($cc),
            handles: <$input as Parameters>::HANDLES,
            handler: |tpm, tag, handles, params, out, limit| {
                framer::execute(tag, handles, params, out, limit, |args: $input| -> Result<$output, Fault> {
                    tpm.$method(args)
                })
            },
        }
    };
}

static COMMANDS: [CommandInfo; 11] = [
    command!(StartAuthSession, StartAuthSessionIn => StartAuthSessionOut, start_auth_session),
    command!(FlushContext, FlushContextIn => NoResponse, flush_context),
    command!(PolicyAuthValue, PolicyAuthValueIn => NoResponse, policy_auth_value),
    command!(PolicyPassword, PolicyPasswordIn => NoResponse, policy_password),
    command!(PolicyCommandCode, PolicyCommandCodeIn => NoResponse, policy_command_code),
    command!(PolicyPcr, PolicyPcrIn => NoResponse, policy_pcr),
    command!(PolicyAuthorize, PolicyAuthorizeIn => NoResponse, policy_authorize),
    command!(PolicyTicket, PolicyTicketIn => NoResponse, policy_ticket),
    command!(PolicySigned, PolicySignedIn => PolicySignedOut, policy_signed),
    command!(PolicyGetDigest, PolicyGetDigestIn => PolicyGetDigestOut, policy_get_digest),
    command!(VerifySignature, VerifySignatureIn => VerifySignatureOut, verify_signature),
];

/// Look up a command the dispatcher has a handler for
pub fn command_info(code: u32) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|info| info.code.to_u32() == code)
}

/// Every command the dispatcher has a handler for
pub fn commands() -> impl Iterator<Item = &'static CommandInfo> {
    COMMANDS.iter()
}

/// Command code of a possibly malformed request, for error reporting
fn peek_command_code(command: &[u8]) -> u32 {
    command
        .get(6..HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or_default()
}

/// A TPM instance
pub struct Tpm {
    pub(crate) config: TpmConfig,
    pub(crate) sessions: SessionTable,
    pub(crate) tickets: TicketAuthority,
    pub(crate) objects: Box<dyn ObjectResolver>,
    pub(crate) pcrs: Box<dyn PcrBank>,
    pub(crate) crypto: Box<dyn CryptoProvider>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) commands: Box<dyn CommandMetadata>,
    response: WriteBuffer,
}

impl Tpm {
    /// Create a TPM backed by the software collaborators
    pub fn new(config: TpmConfig) -> Result<Self> {
        let tickets = TicketAuthority::new(&config, &SoftCrypto)?;
        Ok(Self {
            sessions: SessionTable::new(config.max_sessions, config.evict_when_full),
            tickets,
            objects: Box::new(ObjectTable::new()),
            pcrs: Box::new(SoftPcrBank::new()),
            crypto: Box::new(SoftCrypto),
            clock: Box::new(SystemClock::new()),
            commands: Box::new(BuiltinCommands::with_disabled(
                config.disabled_commands.iter().copied(),
            )),
            response: WriteBuffer::with_capacity(config.max_response_size),
            config,
        })
    }

    pub fn with_objects(mut self, objects: impl ObjectResolver + 'static) -> Self {
        self.objects = Box::new(objects);
        self
    }

    pub fn with_pcrs(mut self, pcrs: impl PcrBank + 'static) -> Self {
        self.pcrs = Box::new(pcrs);
        self
    }

    pub fn with_crypto(mut self, crypto: impl CryptoProvider + 'static) -> Self {
        self.crypto = Box::new(crypto);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_commands(mut self, commands: impl CommandMetadata + 'static) -> Self {
        self.commands = Box::new(commands);
        self
    }

    pub fn config(&self) -> &TpmConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn tickets(&self) -> &TicketAuthority {
        &self.tickets
    }

    pub fn set_hierarchy_enabled(&mut self, hierarchy: u32, enabled: bool) {
        self.tickets.set_enabled(hierarchy, enabled);
    }

    /// Execute one command envelope and return the response envelope.
    ///
    /// Failures are reported as a bare response code.
    pub fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        match self.execute_command(command) {
            Ok(response) => response,
            Err(err) => {
                debug!("{err}");
                error_response(err.response_code())
            }
        }
    }

    /// Execute one command envelope, keeping the failure typed
    pub fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>, CommandError> {
        let header = parse_header(command).map_err(|e| CommandError {
            command_code: peek_command_code(command),
            fault: e.into(),
        })?;
        let code = header.command_code;
        let fail = |fault: Fault| CommandError {
            command_code: code,
            fault,
        };

        let (info, handle_count) = match (command_info(code), self.commands.handle_count(code)) {
            (Some(info), Some(count)) if self.commands.is_implemented(code) => (info, count),
            _ => return Err(fail(TpmError::CommandNotImplemented.into())),
        };
        debug!("dispatching {} (0x{code:08x})", info.name);

        let request = split_request(header, command, handle_count).map_err(fail)?;
        self.check_sessions(&request.sessions).map_err(fail)?;

        // Handlers commit before the response is known to fit
        let checkpoint = self.sessions.clone();
        let mut out = std::mem::take(&mut self.response);
        begin_response(&mut out);
        let limit = self.config.max_response_size;
        let result = (info.handler)(self, header.tag, &request.handles, request.params, &mut out, limit)
            .and_then(|_| {
                let auths = self.session_responses(&request.sessions);
                finish_response(&mut out, header.tag, &auths, limit)?;
                self.commit_sessions(&request.sessions, &auths);
                Ok(out.as_bytes().to_vec())
            });
        if result.is_err() {
            self.sessions = checkpoint;
        }
        out.clear();
        self.response = out;
        result.map_err(fail)
    }

    /// Execute a typed command in-process
    pub fn run<P: Parameters, R: Parameters>(
        &mut self,
        command_code: TpmCc,
        args: &P,
        sessions: &[TpmsAuthCommand],
    ) -> Result<R, CommandError> {
        let fail = |fault: Fault| CommandError {
            command_code: command_code.to_u32(),
            fault,
        };
        let command = TpmCommand::build(command_code, args, sessions);
        let response = self.execute_command(&command)?;
        let response = TpmResponse::parse(&response).map_err(|_| fail(TpmError::Failure.into()))?;
        response.parameters().map_err(fail)
    }

    /// Every non-password session in the authorization area must be active
    fn check_sessions(&self, sessions: &[TpmsAuthCommand]) -> Result<(), Fault> {
        for (index, auth) in sessions.iter().enumerate() {
            if auth.session_handle == tpm_rh::PW {
                continue;
            }
            self.sessions
                .get(auth.session_handle)
                .map_err(|e| e.at_session(index as u8 + 1))?;
        }
        Ok(())
    }

    fn session_responses(&self, sessions: &[TpmsAuthCommand]) -> Vec<TpmsAuthResponse> {
        sessions
            .iter()
            .map(|auth| match self.sessions.get(auth.session_handle) {
                Ok(session) => TpmsAuthResponse {
                    nonce: self.crypto.random(session.hash_alg.digest_size()).into(),
                    attributes: auth.attributes,
                    ..Default::default()
                },
                // Password sessions, and sessions the command itself flushed
                Err(_) => TpmsAuthResponse {
                    attributes: TpmaSa::new().with_continue_session(),
                    ..Default::default()
                },
            })
            .collect()
    }

    /// Roll the nonces of the command's sessions and flush the ones not continued
    fn commit_sessions(&mut self, sessions: &[TpmsAuthCommand], auths: &[TpmsAuthResponse]) {
        for (auth, response) in sessions.iter().zip(auths) {
            let Ok(session) = self.sessions.get_mut(auth.session_handle) else {
                continue;
            };
            session.nonce_caller = auth.nonce.buffer.clone();
            session.nonce_tpm = response.nonce.buffer.clone();
            session.attributes = auth.attributes;
            if !auth.attributes.continue_session() {
                // The handle was just looked up, so the flush cannot miss
                let _ = self.sessions.flush(auth.session_handle);
            }
        }
    }
}

/// A [`Tpm`] shared between channels, one command at a time
#[derive(Clone)]
pub struct SharedTpm {
    inner: Arc<Mutex<Tpm>>,
}

impl SharedTpm {
    pub fn new(tpm: Tpm) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tpm)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Tpm> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn execute(&self, command: &[u8]) -> Vec<u8> {
        self.lock().execute(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorSite;
    use crate::types::*;

    fn tpm() -> Tpm {
        Tpm::new(TpmConfig::default()).unwrap()
    }

    fn start_policy(tpm: &mut Tpm, session_type: TpmSe) -> u32 {
        let args = StartAuthSessionIn::unbound(session_type, TpmAlgId::Sha256, vec![0x11; 16]);
        let out: StartAuthSessionOut = tpm.run(TpmCc::StartAuthSession, &args, &[]).unwrap();
        out.session_handle
    }

    #[test]
    fn test_metadata_table() {
        let info = command_info(TpmCc::PolicySigned.to_u32()).unwrap();
        assert_eq!(info.name, "PolicySigned");
        assert_eq!(info.handles, 2);
        assert_eq!(command_info(TpmCc::FlushContext.to_u32()).unwrap().handles, 0);
        assert!(command_info(0x17E).is_none());
        assert_eq!(commands().count(), 11);
        for info in commands() {
            assert_eq!(TpmCc::from_u32(info.code.to_u32()), Some(info.code));
        }
    }

    #[test]
    fn test_unimplemented_command_leaves_sessions_alone() {
        let mut tpm = tpm();
        let handle = start_policy(&mut tpm, TpmSe::Policy);

        // Names a session in its authorization area, which must not be looked at
        let mut cmd = TpmCommand::raw(TpmSt::Sessions, 0x0000_0199);
        cmd.add_policy_auth(handle);
        let err = tpm.execute_command(&cmd.finalize()).unwrap_err();
        assert_eq!(err.kind(), TpmError::CommandNotImplemented);
        assert_eq!(err.response_code(), 0x143);
        assert!(tpm.sessions().contains(handle));
        assert_eq!(tpm.sessions().len(), 1);
    }

    #[test]
    fn test_disabled_command_is_not_implemented() {
        let config = TpmConfig {
            disabled_commands: vec![TpmCc::PolicyPassword.to_u32()],
            ..Default::default()
        };
        let mut tpm = Tpm::new(config).unwrap();
        let handle = start_policy(&mut tpm, TpmSe::Trial);
        let err = tpm
            .run::<_, NoResponse>(
                TpmCc::PolicyPassword,
                &PolicyPasswordIn {
                    policy_session: handle,
                },
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), TpmError::CommandNotImplemented);
    }

    #[test]
    fn test_error_response_envelope() {
        let mut tpm = tpm();
        let response = tpm.execute(&[0x80, 0x01, 0, 0, 0, 11, 0, 0, 1, 0x6B]);
        assert_eq!(response, vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x42]);
        let response = tpm.execute(&[0x80]);
        assert_eq!(&response[6..], &[0, 0, 0, 0x95]);
    }

    #[test]
    fn test_unknown_session_in_auth_area() {
        let mut tpm = tpm();
        let handle = start_policy(&mut tpm, TpmSe::Policy);
        let err = tpm
            .run::<_, NoResponse>(
                TpmCc::PolicyAuthValue,
                &PolicyAuthValueIn {
                    policy_session: handle,
                },
                &[TpmsAuthCommand::password(), TpmsAuthCommand::policy(0x0300_00FF)],
            )
            .unwrap_err();
        assert_eq!(err.fault, TpmError::HandleNotFound.at_session(2));
        assert_eq!(err.response_code(), 0xA8B);
    }

    #[test]
    fn test_session_without_continue_is_flushed() {
        let mut tpm = tpm();
        let handle = start_policy(&mut tpm, TpmSe::Policy);
        let nonce_before = tpm.sessions().get(handle).unwrap().nonce_tpm.clone();

        let mut auth = TpmsAuthCommand::policy(handle);
        tpm.run::<_, NoResponse>(
            TpmCc::PolicyAuthValue,
            &PolicyAuthValueIn {
                policy_session: handle,
            },
            &[auth.clone()],
        )
        .unwrap();
        let session = tpm.sessions().get(handle).unwrap();
        assert_ne!(session.nonce_tpm, nonce_before);
        assert_eq!(session.nonce_tpm.len(), 32);

        auth.attributes = TpmaSa::new();
        tpm.run::<_, NoResponse>(
            TpmCc::PolicyAuthValue,
            &PolicyAuthValueIn {
                policy_session: handle,
            },
            &[auth],
        )
        .unwrap();
        assert!(!tpm.sessions().contains(handle));
    }

    #[test]
    fn test_failed_command_keeps_session() {
        let mut tpm = tpm();
        let handle = start_policy(&mut tpm, TpmSe::Policy);
        let mut auth = TpmsAuthCommand::policy(handle);
        auth.attributes = TpmaSa::new();
        let err = tpm
            .run::<_, NoResponse>(
                TpmCc::PolicyPcr,
                &PolicyPcrIn {
                    policy_session: handle,
                    pcr_digest: vec![0xEE; 32].into(),
                    pcrs: TpmlPcrSelection::single(TpmAlgId::Sha256, &[0]),
                },
                &[auth],
            )
            .unwrap_err();
        assert_eq!(err.fault.site, Some(ErrorSite::Parameter(1)));
        assert!(tpm.sessions().contains(handle));
    }

    #[test]
    fn test_response_limit() {
        // Room for the StartAuthSession response but not for a digest plus
        // its authorization area
        let config = TpmConfig {
            max_response_size: 60,
            ..Default::default()
        };
        let mut tpm = Tpm::new(config).unwrap();
        let handle = start_policy(&mut tpm, TpmSe::Trial);
        let err = tpm
            .run::<_, PolicyGetDigestOut>(
                TpmCc::PolicyGetDigest,
                &PolicyGetDigestIn {
                    policy_session: handle,
                },
                &[TpmsAuthCommand::policy(handle)],
            )
            .unwrap_err();
        assert_eq!(err.kind(), TpmError::ResourceExhausted(crate::error::Resource::ResponseBuffer));
        assert_eq!(err.response_code(), 0x904);
    }

    #[test]
    fn test_oversized_start_leaves_no_session() {
        // The 48-byte StartAuthSession response does not fit
        let config = TpmConfig {
            max_response_size: 40,
            ..Default::default()
        };
        let mut tpm = Tpm::new(config).unwrap();
        let args = StartAuthSessionIn::unbound(TpmSe::Policy, TpmAlgId::Sha256, vec![0x11; 16]);
        let err = tpm
            .run::<_, StartAuthSessionOut>(TpmCc::StartAuthSession, &args, &[])
            .unwrap_err();
        assert_eq!(err.response_code(), 0x904);
        assert!(tpm.sessions().is_empty());
    }

    #[test]
    fn test_oversized_assertion_is_not_applied() {
        // Room for the session itself, not for the 51-byte PolicyAuthValue response
        let config = TpmConfig {
            max_response_size: 48,
            ..Default::default()
        };
        let mut tpm = Tpm::new(config).unwrap();
        let handle = start_policy(&mut tpm, TpmSe::Policy);
        let nonce_tpm = tpm.sessions().get(handle).unwrap().nonce_tpm.clone();
        let err = tpm
            .run::<_, NoResponse>(
                TpmCc::PolicyAuthValue,
                &PolicyAuthValueIn {
                    policy_session: handle,
                },
                &[TpmsAuthCommand::policy(handle)],
            )
            .unwrap_err();
        assert_eq!(err.response_code(), 0x904);

        let session = tpm.sessions().get(handle).unwrap();
        assert_eq!(session.policy_digest(), &[0u8; 32]);
        assert_eq!(session.nonce_tpm, nonce_tpm);
    }

    #[test]
    fn test_shared_tpm_serializes_commands() {
        let shared = SharedTpm::new(tpm());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let args =
                        StartAuthSessionIn::unbound(TpmSe::Hmac, TpmAlgId::Sha256, vec![1; 16]);
                    let command = TpmCommand::build(TpmCc::StartAuthSession, &args, &[]);
                    let response = TpmResponse::parse(&shared.execute(&command)).unwrap();
                    response.decode::<StartAuthSessionOut>().unwrap().session_handle
                })
            })
            .collect();
        let mut handles: Vec<u32> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), 4);
        assert_eq!(shared.lock().sessions().len(), 4);
    }
}
