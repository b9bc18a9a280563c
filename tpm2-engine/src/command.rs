// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-command parameter layouts
//!
//! Each command's request and response is declared once as an ordered list of
//! handles and typed parameters. The [`tpm_params!`] macro derives the
//! [`Parameters`] implementation from that list, so the wire order of every
//! command is exactly its declaration order.

use super::constants::*;
use super::error::{Fault, Result, TpmError};
use super::marshal::*;
use super::types::*;

/// Typed handle and parameter areas of one request or response
pub trait Parameters: Sized {
    /// Number of 4-byte handles in the handle area
    const HANDLES: usize;

    /// Build from the handle area and a cursor over the parameter area.
    ///
    /// `handles` must hold exactly [`Self::HANDLES`] entries. Errors are
    /// attributed to the 1-based parameter that failed to unmarshal.
    /// Bytes left in `params` afterwards are the caller's concern.
    fn from_parts(handles: &[u32], params: &mut ReadBuffer) -> Result<Self, Fault>;

    fn handles(&self) -> Vec<u32>;

    fn marshal_params(&self, buf: &mut WriteBuffer);

    fn marshal_handles(&self, buf: &mut WriteBuffer) {
        for handle in self.handles() {
            buf.put_u32(handle);
        }
    }
}

macro_rules! one {
    ($x:tt) => {
        1
    };
}

/// Declare a command's request or response layout
macro_rules! tpm_params {
    (
        $(#[$doc:meta])*
        $name:ident {
            handles { $($h:ident),* $(,)? }
            params { $($p:ident : $ty:ty),* $(,)? }
        }
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(pub $h: u32,)*
            $(pub $p: $ty,)*
        }

        impl Parameters for $name {
            const HANDLES: usize = 0 $(+ one!($h))*;

            #[allow(unused_variables, unused_mut)]
            fn from_parts(handles: &[u32], params: &mut ReadBuffer) -> Result<Self, Fault> {
                if handles.len() != Self::HANDLES {
                    return Err(TpmError::Failure.into());
                }
                let mut handles = handles.iter().copied();
                $(let $h = handles.next().unwrap_or_default();)*
                let mut index: u8 = 0;
                $(
                    index += 1;
                    let $p = <$ty as Unmarshal>::unmarshal(params)
                        .map_err(|e| e.at_parameter(index))?;
                )*
                Ok(Self { $($h,)* $($p,)* })
            }

            fn handles(&self) -> Vec<u32> {
                vec![$(self.$h),*]
            }

            #[allow(unused_variables)]
            fn marshal_params(&self, buf: &mut WriteBuffer) {
                $(self.$p.marshal(buf);)*
            }
        }
    };
}

tpm_params!(
    /// Response of commands without output handles or parameters
    NoResponse {
        handles {}
        params {}
    }
);

tpm_params!(
    StartAuthSessionIn {
        handles { tpm_key, bind }
        params {
            nonce_caller: Tpm2bNonce,
            encrypted_salt: Tpm2bEncryptedSecret,
            session_type: TpmSe,
            symmetric: TpmtSymDef,
            auth_hash: TpmiAlgHash,
        }
    }
);

tpm_params!(
    StartAuthSessionOut {
        handles { session_handle }
        params { nonce_tpm: Tpm2bNonce }
    }
);

tpm_params!(
    /// The flushed handle travels in the parameter area
    FlushContextIn {
        handles {}
        params { flush_handle: u32 }
    }
);

tpm_params!(
    PolicyAuthValueIn {
        handles { policy_session }
        params {}
    }
);

tpm_params!(
    PolicyPasswordIn {
        handles { policy_session }
        params {}
    }
);

tpm_params!(
    PolicyCommandCodeIn {
        handles { policy_session }
        params { code: u32 }
    }
);

tpm_params!(
    PolicyPcrIn {
        handles { policy_session }
        params {
            pcr_digest: Tpm2bDigest,
            pcrs: TpmlPcrSelection,
        }
    }
);

tpm_params!(
    PolicyAuthorizeIn {
        handles { policy_session }
        params {
            approved_policy: Tpm2bDigest,
            policy_ref: Tpm2bNonce,
            key_sign: Tpm2bName,
            check_ticket: TpmtTicket,
        }
    }
);

tpm_params!(
    PolicyTicketIn {
        handles { policy_session }
        params {
            timeout: Tpm2bTimeout,
            cp_hash_a: Tpm2bDigest,
            policy_ref: Tpm2bNonce,
            auth_name: Tpm2bName,
            ticket: TpmtTicket,
        }
    }
);

tpm_params!(
    PolicySignedIn {
        handles { auth_object, policy_session }
        params {
            nonce_tpm: Tpm2bNonce,
            cp_hash_a: Tpm2bDigest,
            policy_ref: Tpm2bNonce,
            expiration: i32,
            auth: TpmtSignature,
        }
    }
);

tpm_params!(
    PolicySignedOut {
        handles {}
        params {
            timeout: Tpm2bTimeout,
            policy_ticket: TpmtTicket,
        }
    }
);

tpm_params!(
    PolicyGetDigestIn {
        handles { policy_session }
        params {}
    }
);

tpm_params!(
    PolicyGetDigestOut {
        handles {}
        params { policy_digest: Tpm2bDigest }
    }
);

tpm_params!(
    VerifySignatureIn {
        handles { key_handle }
        params {
            digest: Tpm2bDigest,
            signature: TpmtSignature,
        }
    }
);

tpm_params!(
    VerifySignatureOut {
        handles {}
        params { validation: TpmtTicket }
    }
);

impl StartAuthSessionIn {
    /// An unbound, unsalted session request
    pub fn unbound(session_type: TpmSe, auth_hash: TpmAlgId, nonce_caller: Vec<u8>) -> Self {
        Self {
            tpm_key: tpm_rh::NULL,
            bind: tpm_rh::NULL,
            nonce_caller: nonce_caller.into(),
            encrypted_salt: Tpm2bEncryptedSecret::empty(),
            session_type,
            symmetric: TpmtSymDef::null(),
            auth_hash: TpmiAlgHash(auth_hash),
        }
    }
}
