// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! The table owns every active HMAC, policy and trial session. Policy state
//! (digest, command-code restriction, PCR snapshot) is only written through
//! [`Session::commit`], which the policy engine calls after an assertion has
//! fully validated.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::constants::*;
use super::error::{Resource, Result, TpmError};
use super::types::{Tpm2bName, TpmlPcrSelection};

/// PCR state captured by the first PolicyPCR of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSnapshot {
    pub selection: TpmlPcrSelection,
    pub update_counter: u32,
}

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    pub bound_entity: Option<Tpm2bName>,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    /// Clock reading at creation, in milliseconds
    pub start_time: u64,
}

/// Policy side effects of one assertion, applied all at once
#[derive(Debug, Clone, Default)]
pub(crate) struct PolicyChange {
    pub digest: Vec<u8>,
    pub command_code: Option<u32>,
    pub pcr_snapshot: Option<PcrSnapshot>,
    pub auth_value_needed: Option<bool>,
    pub password_needed: Option<bool>,
    pub cp_hash: Option<Vec<u8>>,
}

/// Authorization session
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    pub bound_entity: Option<Tpm2bName>,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    pub attributes: TpmaSa,
    pub start_time: u64,
    policy_digest: Vec<u8>,
    command_code: Option<u32>,
    pcr_snapshot: Option<PcrSnapshot>,
    is_auth_value_needed: bool,
    is_password_needed: bool,
    cp_hash: Option<Vec<u8>>,
    last_used: u64,
}

impl Session {
    fn new(handle: u32, params: SessionParams, stamp: u64) -> Self {
        Self {
            handle,
            session_type: params.session_type,
            hash_alg: params.hash_alg,
            bound_entity: params.bound_entity,
            nonce_caller: params.nonce_caller,
            nonce_tpm: params.nonce_tpm,
            attributes: TpmaSa::new(),
            start_time: params.start_time,
            policy_digest: vec![0u8; params.hash_alg.digest_size()],
            command_code: None,
            pcr_snapshot: None,
            is_auth_value_needed: false,
            is_password_needed: false,
            cp_hash: None,
            last_used: stamp,
        }
    }

    pub fn is_policy(&self) -> bool {
        self.session_type.is_policy()
    }

    pub fn is_trial(&self) -> bool {
        self.session_type == TpmSe::Trial
    }

    pub fn policy_digest(&self) -> &[u8] {
        &self.policy_digest
    }

    pub fn command_code(&self) -> Option<u32> {
        self.command_code
    }

    pub fn pcr_snapshot(&self) -> Option<&PcrSnapshot> {
        self.pcr_snapshot.as_ref()
    }

    pub fn is_auth_value_needed(&self) -> bool {
        self.is_auth_value_needed
    }

    pub fn is_password_needed(&self) -> bool {
        self.is_password_needed
    }

    pub fn cp_hash(&self) -> Option<&[u8]> {
        self.cp_hash.as_deref()
    }

    /// Apply the effects of a validated assertion.
    ///
    /// The command-code restriction, PCR snapshot and cpHash are set-once:
    /// a value already present is never overwritten.
    pub(crate) fn commit(&mut self, change: PolicyChange) {
        debug_assert_eq!(change.digest.len(), self.hash_alg.digest_size());
        self.policy_digest = change.digest;
        if self.command_code.is_none() {
            self.command_code = change.command_code;
        }
        if self.pcr_snapshot.is_none() {
            self.pcr_snapshot = change.pcr_snapshot;
        }
        if self.cp_hash.is_none() {
            self.cp_hash = change.cp_hash;
        }
        if let Some(needed) = change.auth_value_needed {
            self.is_auth_value_needed = needed;
        }
        if let Some(needed) = change.password_needed {
            self.is_password_needed = needed;
        }
    }
}

/// Fixed-capacity table of active sessions
#[derive(Debug, Clone)]
pub struct SessionTable {
    sessions: HashMap<u32, Session>,
    capacity: usize,
    evict_when_full: bool,
    next_index: u32,
    clock: u64,
}

impl SessionTable {
    pub fn new(capacity: usize, evict_when_full: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
            evict_when_full,
            next_index: 0,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = u32> + '_ {
        self.sessions.keys().copied()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn allocate_handle(&mut self, session_type: TpmSe) -> u32 {
        let base = match session_type {
            TpmSe::Hmac => TpmHt::HmacSession.base(),
            TpmSe::Policy | TpmSe::Trial => TpmHt::PolicySession.base(),
        };
        loop {
            let handle = base | (self.next_index & 0x00FF_FFFF);
            self.next_index = self.next_index.wrapping_add(1);
            if !self.sessions.contains_key(&handle) {
                return handle;
            }
        }
    }

    fn evict_lru(&mut self) -> Option<u32> {
        let handle = self
            .sessions
            .values()
            .min_by_key(|s| s.last_used)
            .map(|s| s.handle)?;
        self.sessions.remove(&handle);
        Some(handle)
    }

    /// Open a session with a zero policy digest and return its handle
    pub fn start(&mut self, params: SessionParams) -> Result<u32> {
        if self.sessions.len() >= self.capacity {
            if !self.evict_when_full || self.capacity == 0 {
                return Err(TpmError::ResourceExhausted(Resource::SessionTable));
            }
            if let Some(evicted) = self.evict_lru() {
                warn!("session table full, evicted session 0x{evicted:08x}");
            }
        }
        let handle = self.allocate_handle(params.session_type);
        let stamp = self.tick();
        debug!(
            "started {:?} session 0x{handle:08x} ({:?})",
            params.session_type, params.hash_alg
        );
        self.sessions
            .insert(handle, Session::new(handle, params, stamp));
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> Result<&Session> {
        self.sessions.get(&handle).ok_or(TpmError::HandleNotFound)
    }

    /// Mutable access; counts as a use for eviction ordering
    pub fn get_mut(&mut self, handle: u32) -> Result<&mut Session> {
        let stamp = self.tick();
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(TpmError::HandleNotFound)?;
        session.last_used = stamp;
        Ok(session)
    }

    pub fn flush(&mut self, handle: u32) -> Result<Session> {
        let session = self
            .sessions
            .remove(&handle)
            .ok_or(TpmError::HandleNotFound)?;
        debug!("flushed session 0x{handle:08x}");
        Ok(session)
    }
}
