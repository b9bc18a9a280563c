// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command framing around the per-command parameter layouts
//!
//! Response layout written by [`marshal_response`]:
//!
//! ```text
//! [handle area][parameterSize:4 if tag == TPM_ST_SESSIONS][parameter area]
//! ```
//!
//! `parameterSize` counts only the parameter area. It is present even when
//! the parameter area is empty.

use super::command::Parameters;
use super::constants::*;
use super::error::{Fault, Resource, Result, TpmError};
use super::marshal::{ReadBuffer, WriteBuffer};

/// Build a request from its handle area and parameter area.
///
/// The parameter area must be consumed exactly; trailing bytes are a size error.
pub fn unmarshal_request<P: Parameters>(handles: &[u32], params: &[u8]) -> Result<P, Fault> {
    let mut buf = ReadBuffer::new(params);
    let args = P::from_parts(handles, &mut buf)?;
    buf.ensure_consumed()?;
    Ok(args)
}

/// Append the response handle and parameter areas to `buf`.
///
/// Returns the number of bytes written, size field included. Fails without
/// leaving partial output if `buf` would grow past `limit` bytes.
pub fn marshal_response<R: Parameters>(
    tag: TpmSt,
    response: &R,
    buf: &mut WriteBuffer,
    limit: usize,
) -> Result<usize> {
    let start = buf.len();
    response.marshal_handles(buf);
    if tag == TpmSt::Sessions {
        let pos = buf.reserve_u32();
        response.marshal_params(buf);
        let size = buf.len() - pos - 4;
        buf.update_u32(pos, size as u32);
    } else {
        response.marshal_params(buf);
    }
    if buf.len() > limit {
        buf.truncate(start);
        return Err(TpmError::ResourceExhausted(Resource::ResponseBuffer));
    }
    Ok(buf.len() - start)
}

/// Unmarshal, run `f` and marshal its result into `out`
pub fn execute<P, R, F>(
    tag: TpmSt,
    handles: &[u32],
    params: &[u8],
    out: &mut WriteBuffer,
    limit: usize,
    f: F,
) -> Result<usize, Fault>
where
    P: Parameters,
    R: Parameters,
    F: FnOnce(P) -> Result<R, Fault>,
{
    let args = unmarshal_request::<P>(handles, params)?;
    let response = f(args)?;
    Ok(marshal_response(tag, &response, out, limit)?)
}
