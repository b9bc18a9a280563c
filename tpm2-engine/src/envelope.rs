// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command and response envelopes
//!
//! ```text
//! request:  [tag:2][size:4][commandCode:4][handles:4*N]
//!           ([authSize:4][TPMS_AUTH_COMMAND...] if tag == TPM_ST_SESSIONS)
//!           [parameters]
//! response: [tag:2][size:4][responseCode:4][handles][parameterSize:4]?[parameters]
//!           ([TPMS_AUTH_RESPONSE...] if tag == TPM_ST_SESSIONS)
//! ```
//!
//! The server side splits requests and assembles responses; [`TpmCommand`]
//! and [`TpmResponse`] are the matching client-side builder and parser.

use anyhow::{bail, Context};

use super::command::Parameters;
use super::constants::*;
use super::error::{Fault, Resource, Result, TpmError};
use super::marshal::*;
use super::types::*;

/// Fixed header of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub tag: TpmSt,
    pub size: u32,
    pub command_code: u32,
}

/// A request split into its areas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub header: RequestHeader,
    pub handles: Vec<u32>,
    pub sessions: Vec<TpmsAuthCommand>,
    pub params: &'a [u8],
}

/// Parse and validate the 10-byte request header
pub fn parse_header(command: &[u8]) -> Result<RequestHeader> {
    if command.len() < HEADER_SIZE {
        return Err(TpmError::Size);
    }
    let mut buf = ReadBuffer::new(command);
    let tag = match TpmSt::from_u16(buf.get_u16()?) {
        Some(tag @ (TpmSt::NoSessions | TpmSt::Sessions)) => tag,
        _ => return Err(TpmError::BadTag),
    };
    let size = buf.get_u32()?;
    if size as usize != command.len() {
        return Err(TpmError::CommandSize);
    }
    let command_code = buf.get_u32()?;
    Ok(RequestHeader {
        tag,
        size,
        command_code,
    })
}

/// Split the body after the header into handle, authorization and parameter areas
pub fn split_request(
    header: RequestHeader,
    command: &[u8],
    handle_count: usize,
) -> Result<Request<'_>, Fault> {
    let mut buf = ReadBuffer::new(command.get(HEADER_SIZE..).unwrap_or_default());
    let mut handles = Vec::with_capacity(handle_count);
    for index in 0..handle_count {
        let handle = buf
            .get_u32()
            .map_err(|e| e.at_handle(index as u8 + 1))?;
        handles.push(handle);
    }

    let mut sessions = Vec::new();
    if header.tag == TpmSt::Sessions {
        let auth_size = buf.get_u32().map_err(|_| TpmError::AuthSize)? as usize;
        let area = buf.get_slice(auth_size).map_err(|_| TpmError::AuthSize)?;
        let mut auth = ReadBuffer::new(area);
        while auth.remaining() > 0 {
            if sessions.len() == MAX_SESSION_NUM {
                return Err(TpmError::AuthSize.into());
            }
            let entry = TpmsAuthCommand::unmarshal(&mut auth)
                .map_err(|_| TpmError::AuthSize.at_session(sessions.len() as u8 + 1))?;
            sessions.push(entry);
        }
        if sessions.is_empty() {
            return Err(TpmError::AuthSize.into());
        }
    }

    Ok(Request {
        header,
        handles,
        sessions,
        params: buf.get_remaining(),
    })
}

/// Reset `buf` to an empty response with room for the header
pub fn begin_response(buf: &mut WriteBuffer) {
    buf.clear();
    buf.put_bytes(&[0u8; HEADER_SIZE]);
}

/// Append the response authorization area and fill in the header
pub fn finish_response(
    buf: &mut WriteBuffer,
    tag: TpmSt,
    auths: &[TpmsAuthResponse],
    limit: usize,
) -> Result<()> {
    if tag == TpmSt::Sessions {
        for auth in auths {
            auth.marshal(buf);
        }
    }
    if buf.len() > limit {
        return Err(TpmError::ResourceExhausted(Resource::ResponseBuffer));
    }
    if buf.len() < HEADER_SIZE {
        return Err(TpmError::Failure);
    }
    let size = buf.len() as u32;
    buf.update_u16(0, tag.to_u16());
    buf.update_u32(2, size);
    buf.update_u32(6, tpm_rc::SUCCESS);
    Ok(())
}

/// A bare `TPM_ST_NO_SESSIONS` response carrying only `response_code`
pub fn error_response(response_code: u32) -> Vec<u8> {
    let mut buf = WriteBuffer::with_capacity(HEADER_SIZE);
    TpmSt::NoSessions.marshal(&mut buf);
    buf.put_u32(HEADER_SIZE as u32);
    buf.put_u32(response_code);
    buf.into_vec()
}

/// TPM command builder
pub struct TpmCommand {
    buf: WriteBuffer,
}

impl TpmCommand {
    fn with_tag(tag: TpmSt, command_code: u32) -> Self {
        let mut buf = WriteBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code);

        Self { buf }
    }

    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code.to_u32())
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code.to_u32())
    }

    /// Create a command for a raw command code, which need not be known
    pub fn raw(tag: TpmSt, command_code: u32) -> Self {
        Self::with_tag(tag, command_code)
    }

    /// Build a complete command from its typed request
    pub fn build<P: Parameters>(command_code: TpmCc, args: &P, sessions: &[TpmsAuthCommand]) -> Vec<u8> {
        let mut cmd = if sessions.is_empty() {
            Self::new(command_code)
        } else {
            Self::with_sessions(command_code)
        };
        args.marshal_handles(&mut cmd.buf);
        if !sessions.is_empty() {
            cmd.add_auth_area(sessions);
        }
        args.marshal_params(&mut cmd.buf);
        cmd.finalize()
    }

    /// Add a handle to the command
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Add raw bytes to the command
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Add a TPM2B structure
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Add an authorization area holding `sessions`
    pub fn add_auth_area(&mut self, sessions: &[TpmsAuthCommand]) {
        let pos = self.buf.reserve_u32();
        for session in sessions {
            session.marshal(&mut self.buf);
        }
        let size = self.buf.len() - pos - 4;
        self.buf.update_u32(pos, size as u32);
    }

    /// Add a policy session authorization
    pub fn add_policy_auth(&mut self, session_handle: u32) {
        self.add_auth_area(&[TpmsAuthCommand::policy(session_handle)]);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> anyhow::Result<Self> {
        if response.len() < HEADER_SIZE {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ReadBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow::anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if response.len() != size {
            bail!(
                "TPM response size mismatch: expected {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;

        Ok(Self {
            tag,
            response_code,
            data: buf.get_remaining().to_vec(),
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self) -> anyhow::Result<()> {
        if !self.is_success() {
            bail!("TPM error: 0x{:08x}", self.response_code);
        }
        Ok(())
    }

    /// Split the body into `(handles, parameter area, authorization area)`
    fn areas(&self, handle_count: usize) -> Result<(Vec<u32>, &[u8], &[u8])> {
        let mut buf = ReadBuffer::new(&self.data);
        let handles = (0..handle_count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;
        if self.tag == TpmSt::Sessions {
            let size = buf.get_u32()? as usize;
            let params = buf.get_slice(size)?;
            Ok((handles, params, buf.get_remaining()))
        } else {
            Ok((handles, buf.get_remaining(), &[][..]))
        }
    }

    /// Typed handle and parameter areas; the parameter area must be consumed exactly
    pub fn parameters<R: Parameters>(&self) -> Result<R, Fault> {
        let (handles, params, _) = self.areas(R::HANDLES)?;
        let mut buf = ReadBuffer::new(params);
        let response = R::from_parts(&handles, &mut buf)?;
        buf.ensure_consumed()?;
        Ok(response)
    }

    /// Decode the typed response of a successful command
    pub fn decode<R: Parameters>(&self) -> anyhow::Result<R> {
        self.ensure_success()?;
        self.parameters()
            .context("malformed response parameters")
    }

    /// The authorization area of a sessions-bearing response
    pub fn auth_responses(&self, handle_count: usize) -> anyhow::Result<Vec<TpmsAuthResponse>> {
        let (_, _, area) = self.areas(handle_count)?;
        let mut buf = ReadBuffer::new(area);
        let mut auths = Vec::new();
        while buf.remaining() > 0 {
            auths.push(TpmsAuthResponse::unmarshal(&mut buf)?);
        }
        Ok(auths)
    }
}
