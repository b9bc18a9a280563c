// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software collaborators: hashing and signatures, PCR banks, an object
//! table and clocks

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use super::collab::*;
use super::constants::*;
use super::dispatch;
use super::error::{Result, TpmError};
use super::marshal::{Marshal, WriteBuffer};
use super::types::*;

/// Hash the concatenation of `parts` with `alg`
pub fn digest(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    macro_rules! do_hash {
        ($hash: ty) => {{
            let mut hasher = <$hash>::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }};
    }
    let output = match alg {
        TpmAlgId::Sha256 => do_hash!(Sha256),
        TpmAlgId::Sha384 => do_hash!(Sha384),
        TpmAlgId::Sha512 => do_hash!(Sha512),
        _ => return Err(TpmError::Value),
    };
    Ok(output)
}

/// HMAC of the concatenation of `parts` with `alg`
pub fn keyed_digest(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    macro_rules! do_hmac {
        ($hash: ty) => {{
            let mut mac = <Hmac<$hash> as Mac>::new_from_slice(key).map_err(|_| TpmError::Failure)?;
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }};
    }
    let output = match alg {
        TpmAlgId::Sha256 => do_hmac!(Sha256),
        TpmAlgId::Sha384 => do_hmac!(Sha384),
        TpmAlgId::Sha512 => do_hmac!(Sha512),
        _ => return Err(TpmError::Value),
    };
    Ok(output)
}

/// Left-pad a big-endian scalar to 32 bytes
fn scalar32(v: &[u8]) -> Option<[u8; 32]> {
    if v.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - v.len()..].copy_from_slice(v);
    Some(out)
}

/// Crypto provider backed by RustCrypto
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftCrypto;

impl SoftCrypto {
    fn verify_ecdsa(x: &[u8], y: &[u8], r: &[u8], s: &[u8], digest: &[u8]) -> Result<bool> {
        let (Some(x), Some(y)) = (scalar32(x), scalar32(y)) else {
            return Err(TpmError::Value);
        };
        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);
        let verifying_key = VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| TpmError::Value)?;

        let (Some(r), Some(s)) = (scalar32(r), scalar32(s)) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&[r, s].concat()) else {
            return Ok(false);
        };
        match verifying_key.verify_prehash(digest, &signature) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("ECC signature verification failed: {e}");
                Ok(false)
            }
        }
    }

    fn verify_rsassa(
        modulus: &[u8],
        exponent: u32,
        hash: TpmAlgId,
        sig: &[u8],
        digest: &[u8],
    ) -> Result<bool> {
        let exponent = if exponent == 0 { 65537 } else { exponent };
        let rsa_key = RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from(exponent))
            .map_err(|_| TpmError::Value)?;
        let padding = match hash {
            TpmAlgId::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            TpmAlgId::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            TpmAlgId::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            _ => return Ok(false),
        };
        match rsa_key.verify(padding, digest, sig) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("RSA signature verification failed: {e}");
                Ok(false)
            }
        }
    }
}

impl CryptoProvider for SoftCrypto {
    fn hash(&self, alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
        digest(alg, parts)
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        keyed_digest(alg, key, parts)
    }

    fn verify_signature(
        &self,
        key: &PublicKey,
        digest: &[u8],
        signature: &TpmtSignature,
    ) -> Result<bool> {
        match (key, signature) {
            (PublicKey::Ecc { x, y }, TpmtSignature::EcDsa { r, s, .. }) => {
                Self::verify_ecdsa(x, y, r.as_bytes(), s.as_bytes(), digest)
            }
            (PublicKey::Rsa { modulus, exponent }, TpmtSignature::RsaSsa { hash, sig }) => {
                Self::verify_rsassa(modulus, *exponent, *hash, sig.as_bytes(), digest)
            }
            _ => {
                debug!(
                    "signature scheme {:?} does not match the key",
                    signature.sig_alg()
                );
                Ok(false)
            }
        }
    }

    fn random(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut out);
        out
    }
}

/// Public key of a P-256 verifying key
pub fn ecc_public_key(key: &VerifyingKey) -> PublicKey {
    let point = key.to_encoded_point(false);
    PublicKey::Ecc {
        x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
        y: point.y().map(|y| y.to_vec()).unwrap_or_default(),
    }
}

/// Sign a digest with a P-256 key, producing a TPMT_SIGNATURE
pub fn ecdsa_sign(key: &SigningKey, digest: &[u8]) -> Result<TpmtSignature> {
    let signature: Signature = key.sign_prehash(digest).map_err(|_| TpmError::Value)?;
    let (r, s) = signature.split_bytes();
    Ok(TpmtSignature::EcDsa {
        hash: TpmAlgId::Sha256,
        r: r.to_vec().into(),
        s: s.to_vec().into(),
    })
}

const PCR_BANKS: [TpmAlgId; 3] = [TpmAlgId::Sha256, TpmAlgId::Sha384, TpmAlgId::Sha512];

#[derive(Debug)]
struct PcrState {
    banks: HashMap<TpmAlgId, Vec<Vec<u8>>>,
    update_counter: u32,
}

/// In-memory PCR banks for SHA-256, SHA-384 and SHA-512
#[derive(Debug, Clone)]
pub struct SoftPcrBank {
    state: Arc<Mutex<PcrState>>,
}

impl Default for SoftPcrBank {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftPcrBank {
    pub fn new() -> Self {
        let banks = PCR_BANKS
            .iter()
            .map(|&alg| (alg, vec![vec![0u8; alg.digest_size()]; IMPLEMENTATION_PCR]))
            .collect();
        Self {
            state: Arc::new(Mutex::new(PcrState {
                banks,
                update_counter: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PcrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Extend `data` into PCR `index` of every bank: `pcr = H(pcr || H(data))`
    pub fn extend(&self, index: usize, data: &[u8]) -> Result<()> {
        if index >= IMPLEMENTATION_PCR {
            return Err(TpmError::Value);
        }
        let mut state = self.state();
        for (&alg, bank) in state.banks.iter_mut() {
            let measurement = digest(alg, &[data])?;
            bank[index] = digest(alg, &[bank[index].as_slice(), &measurement])?;
        }
        state.update_counter = state.update_counter.wrapping_add(1);
        Ok(())
    }

    pub fn read(&self, index: usize, alg: TpmAlgId) -> Option<Vec<u8>> {
        self.state().banks.get(&alg)?.get(index).cloned()
    }
}

impl PcrBank for SoftPcrBank {
    fn current_digest(&self, selection: &TpmlPcrSelection, alg: TpmAlgId) -> Result<Vec<u8>> {
        let state = self.state();
        let mut values: Vec<&[u8]> = Vec::new();
        for sel in &selection.pcr_selections {
            let bank = state.banks.get(&sel.hash).ok_or(TpmError::Value)?;
            for index in sel.selected() {
                values.push(&bank[index]);
            }
        }
        digest(alg, &values)
    }

    fn update_counter(&self) -> u32 {
        self.state().update_counter
    }
}

/// Name of a software-loaded key: `nameAlg || SHA-256(public encoding)`
pub fn public_key_name(public: &PublicKey) -> Result<Tpm2bName> {
    let mut encoded = WriteBuffer::new();
    match public {
        PublicKey::Rsa { modulus, exponent } => {
            TpmAlgId::Rsa.marshal(&mut encoded);
            encoded.put_u32(*exponent);
            encoded.put_tpm2b(modulus);
        }
        PublicKey::Ecc { x, y } => {
            TpmAlgId::Ecc.marshal(&mut encoded);
            encoded.put_u16(TpmEccCurve::NistP256 as u16);
            encoded.put_tpm2b(x);
            encoded.put_tpm2b(y);
        }
    }
    let hash = digest(TpmAlgId::Sha256, &[encoded.as_bytes()])?;
    let mut name = TpmAlgId::Sha256.to_u16().to_be_bytes().to_vec();
    name.extend_from_slice(&hash);
    Ok(Tpm2bName::new(name))
}

#[derive(Debug, Default)]
struct ObjectState {
    objects: HashMap<u32, Entity>,
    next_handle: u32,
}

/// In-memory handle table for transient objects plus the permanent hierarchies
#[derive(Debug, Clone, Default)]
pub struct ObjectTable {
    state: Arc<Mutex<ObjectState>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a public key into `hierarchy` and return its entity
    pub fn load_key(&self, public: PublicKey, hierarchy: u32) -> Result<Entity> {
        let name = public_key_name(&public)?;
        let mut state = self.state();
        let handle = TpmHt::Transient.base() | (state.next_handle & 0x00FF_FFFF);
        state.next_handle = state.next_handle.wrapping_add(1);
        let entity = Entity {
            handle,
            name,
            hierarchy,
            public: Some(public),
        };
        state.objects.insert(handle, entity.clone());
        Ok(entity)
    }

    pub fn unload(&self, handle: u32) -> Option<Entity> {
        self.state().objects.remove(&handle)
    }
}

impl ObjectResolver for ObjectTable {
    fn resolve(&self, handle: u32) -> Option<Entity> {
        match handle {
            tpm_rh::OWNER | tpm_rh::ENDORSEMENT | tpm_rh::PLATFORM | tpm_rh::NULL => Some(Entity {
                handle,
                name: Tpm2bName::new(handle.to_be_bytes().to_vec()),
                hierarchy: handle,
                public: None,
            }),
            _ => self.state().objects.get(&handle).cloned(),
        }
    }
}

/// Wall clock measured from construction
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
    reset_count: u32,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            reset_count: 0,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn reset_count(&self) -> u32 {
        self.reset_count
    }
}

#[derive(Debug, Default)]
struct ManualTime {
    now: AtomicU64,
    reset_count: AtomicU32,
}

/// Clock driven explicitly, shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Arc<ManualTime>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.time.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.time.now.store(millis, Ordering::SeqCst);
    }

    /// Simulate a TPM reset: time restarts at zero and the reset count moves on
    pub fn reset(&self) {
        self.time.now.store(0, Ordering::SeqCst);
        self.time.reset_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.time.now.load(Ordering::SeqCst)
    }

    fn reset_count(&self) -> u32 {
        self.time.reset_count.load(Ordering::SeqCst)
    }
}

/// Command metadata derived from the dispatch table
#[derive(Debug, Clone, Default)]
pub struct BuiltinCommands {
    disabled: BTreeSet<u32>,
}

impl BuiltinCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `codes` as not implemented even though a handler exists
    pub fn with_disabled(codes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            disabled: codes.into_iter().collect(),
        }
    }
}

impl CommandMetadata for BuiltinCommands {
    fn is_implemented(&self, code: u32) -> bool {
        !self.disabled.contains(&code) && dispatch::command_info(code).is_some()
    }

    fn handle_count(&self, code: u32) -> Option<usize> {
        dispatch::command_info(code).map(|info| info.handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_digest_of_zero_bank() {
        let pcrs = SoftPcrBank::new();
        let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &[7]);
        let value = pcrs.current_digest(&selection, TpmAlgId::Sha256).unwrap();
        assert_eq!(
            hex::encode(value),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
        assert_eq!(pcrs.update_counter(), 0);
    }

    #[test]
    fn test_pcr_extend_bumps_counter() {
        let pcrs = SoftPcrBank::new();
        pcrs.extend(7, b"boot").unwrap();
        assert_eq!(pcrs.update_counter(), 1);
        let expected = digest(
            TpmAlgId::Sha256,
            &[&[0u8; 32][..], &digest(TpmAlgId::Sha256, &[b"boot"]).unwrap()],
        )
        .unwrap();
        assert_eq!(pcrs.read(7, TpmAlgId::Sha256).unwrap(), expected);
        assert_eq!(pcrs.extend(24, b"x"), Err(TpmError::Value));
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let public = ecc_public_key(key.verifying_key());
        let message = digest(TpmAlgId::Sha256, &[b"message"]).unwrap();
        let signature = ecdsa_sign(&key, &message).unwrap();
        assert!(SoftCrypto.verify_signature(&public, &message, &signature).unwrap());

        let other = digest(TpmAlgId::Sha256, &[b"other"]).unwrap();
        assert!(!SoftCrypto.verify_signature(&public, &other, &signature).unwrap());
        assert!(!SoftCrypto
            .verify_signature(&public, &message, &TpmtSignature::Null)
            .unwrap());
    }

    #[test]
    fn test_object_table_resolves_hierarchies() {
        let objects = ObjectTable::new();
        let owner = objects.resolve(tpm_rh::OWNER).unwrap();
        assert_eq!(owner.name.as_bytes(), &[0x40, 0x00, 0x00, 0x01]);

        let key = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let entity = objects
            .load_key(ecc_public_key(key.verifying_key()), tpm_rh::OWNER)
            .unwrap();
        assert_eq!(TpmHt::of(entity.handle), Some(TpmHt::Transient));
        assert_eq!(entity.name.name_alg(), Some(TpmAlgId::Sha256));
        assert_eq!(entity.name.len(), 34);
        assert_eq!(objects.resolve(entity.handle), Some(entity.clone()));
        objects.unload(entity.handle);
        assert_eq!(objects.resolve(entity.handle), None);
    }

    #[test]
    fn test_manual_clock_reset() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        clock.advance(1500);
        assert_eq!(shared.now(), 1500);
        clock.reset();
        assert_eq!(shared.now(), 0);
        assert_eq!(shared.reset_count(), 1);
    }
}
