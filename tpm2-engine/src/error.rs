// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy and its mapping to TPM response codes

use thiserror::Error;

use super::constants::tpm_rc;

pub type Result<T, E = TpmError> = std::result::Result<T, E>;

/// Why a policy assertion or ticket was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFault {
    PcrMismatch,
    PcrChanged,
    ApprovedPolicyMismatch,
    TicketInvalid,
    TicketExpired,
    HierarchyDisabled,
    SignatureInvalid,
    NonceMismatch,
    CpHashMismatch,
    CommandCode,
}

impl std::fmt::Display for PolicyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyFault::PcrMismatch => "PCR digest mismatch",
            PolicyFault::PcrChanged => "PCRs changed since the session snapshot",
            PolicyFault::ApprovedPolicyMismatch => "approved policy does not match policy digest",
            PolicyFault::TicketInvalid => "ticket verification failed",
            PolicyFault::TicketExpired => "ticket or authorization expired",
            PolicyFault::HierarchyDisabled => "ticket hierarchy is disabled",
            PolicyFault::SignatureInvalid => "signature verification failed",
            PolicyFault::NonceMismatch => "nonce does not match the session",
            PolicyFault::CpHashMismatch => "cpHash conflicts with the session",
            PolicyFault::CommandCode => "command code is not implemented",
        };
        f.write_str(s)
    }
}

/// Which fixed-capacity resource ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    SessionTable,
    ResponseBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TpmError {
    #[error("buffer size error")]
    Size,
    #[error("value out of range")]
    Value,
    #[error("bad envelope tag")]
    BadTag,
    #[error("command size does not match the envelope")]
    CommandSize,
    #[error("malformed authorization area")]
    AuthSize,
    #[error("command not implemented")]
    CommandNotImplemented,
    #[error("handle not found")]
    HandleNotFound,
    #[error("policy failure: {0}")]
    PolicyFailure(PolicyFault),
    #[error("session state invalid")]
    SessionStateInvalid,
    #[error("resource exhausted: {0:?}")]
    ResourceExhausted(Resource),
    #[error("internal failure")]
    Failure,
}

impl TpmError {
    pub fn policy(fault: PolicyFault) -> Self {
        TpmError::PolicyFailure(fault)
    }

    /// Base response code, without any index information
    pub fn base_code(self) -> u32 {
        match self {
            TpmError::Size => tpm_rc::SIZE,
            TpmError::Value | TpmError::SessionStateInvalid => tpm_rc::VALUE,
            TpmError::BadTag => tpm_rc::BAD_TAG,
            TpmError::CommandSize => tpm_rc::COMMAND_SIZE,
            TpmError::AuthSize => tpm_rc::AUTHSIZE,
            TpmError::CommandNotImplemented => tpm_rc::COMMAND_CODE,
            TpmError::HandleNotFound => tpm_rc::HANDLE,
            TpmError::PolicyFailure(fault) => match fault {
                PolicyFault::PcrMismatch => tpm_rc::POLICY_FAIL,
                PolicyFault::PcrChanged => tpm_rc::PCR_CHANGED,
                PolicyFault::ApprovedPolicyMismatch => tpm_rc::VALUE,
                PolicyFault::TicketInvalid => tpm_rc::TICKET,
                PolicyFault::TicketExpired => tpm_rc::EXPIRED,
                PolicyFault::HierarchyDisabled => tpm_rc::HIERARCHY,
                PolicyFault::SignatureInvalid => tpm_rc::SIGNATURE,
                PolicyFault::NonceMismatch => tpm_rc::NONCE,
                PolicyFault::CpHashMismatch => tpm_rc::CPHASH,
                PolicyFault::CommandCode => tpm_rc::POLICY_CC,
            },
            TpmError::ResourceExhausted(Resource::SessionTable) => tpm_rc::SESSION_MEMORY,
            TpmError::ResourceExhausted(Resource::ResponseBuffer) => tpm_rc::MEMORY,
            TpmError::Failure => tpm_rc::FAILURE,
        }
    }

    pub fn at(self, site: ErrorSite) -> Fault {
        Fault {
            error: self,
            site: Some(site),
        }
    }

    pub fn at_handle(self, index: u8) -> Fault {
        self.at(ErrorSite::Handle(index))
    }

    pub fn at_parameter(self, index: u8) -> Fault {
        self.at(ErrorSite::Parameter(index))
    }

    pub fn at_session(self, index: u8) -> Fault {
        self.at(ErrorSite::Session(index))
    }
}

/// Position (1-based) of the handle, parameter or session an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSite {
    Handle(u8),
    Parameter(u8),
    Session(u8),
}

/// An error raised while executing one command, with its attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct Fault {
    pub error: TpmError,
    pub site: Option<ErrorSite>,
}

impl Fault {
    /// Attribute the fault to a site unless it already has one
    pub fn or_at(self, site: ErrorSite) -> Self {
        Self {
            site: self.site.or(Some(site)),
            ..self
        }
    }

    pub fn response_code(&self) -> u32 {
        let rc = self.error.base_code();
        if !tpm_rc::is_format_one(rc) {
            return rc;
        }
        match self.site {
            Some(ErrorSite::Handle(n)) => tpm_rc::with_handle(rc, n),
            Some(ErrorSite::Parameter(n)) => tpm_rc::with_parameter(rc, n),
            Some(ErrorSite::Session(n)) => tpm_rc::with_session(rc, n),
            None => rc,
        }
    }
}

impl From<TpmError> for Fault {
    fn from(error: TpmError) -> Self {
        Self { error, site: None }
    }
}

/// A failed command as reported by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command 0x{command_code:08x} failed: {fault} (rc 0x{:03x})", .fault.response_code())]
pub struct CommandError {
    pub command_code: u32,
    pub fault: Fault,
}

impl CommandError {
    pub fn response_code(&self) -> u32 {
        self.fault.response_code()
    }

    pub fn kind(&self) -> TpmError {
        self.fault.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_one_indices() {
        assert_eq!(TpmError::Size.at_parameter(1).response_code(), 0x1D5);
        assert_eq!(TpmError::HandleNotFound.at_handle(1).response_code(), 0x18B);
        assert_eq!(TpmError::HandleNotFound.at_session(1).response_code(), 0x98B);
        assert_eq!(Fault::from(TpmError::Size).response_code(), 0x095);
    }

    #[test]
    fn test_format_zero_ignores_site() {
        let fault = TpmError::CommandNotImplemented.at_parameter(3);
        assert_eq!(fault.response_code(), tpm_rc::COMMAND_CODE);
        let fault = TpmError::ResourceExhausted(Resource::SessionTable).at_handle(1);
        assert_eq!(fault.response_code(), tpm_rc::SESSION_MEMORY);
    }

    #[test]
    fn test_or_at_keeps_first_site() {
        let fault = TpmError::Size.at_parameter(2).or_at(ErrorSite::Parameter(5));
        assert_eq!(fault.site, Some(ErrorSite::Parameter(2)));
        let fault = Fault::from(TpmError::Size).or_at(ErrorSite::Parameter(5));
        assert_eq!(fault.site, Some(ErrorSite::Parameter(5)));
    }
}
