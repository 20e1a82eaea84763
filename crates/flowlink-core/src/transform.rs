//! Channel transforms
//!
//! A [`BufferTransform`] is the per-session capability behind the channel
//! strategy: it runs a three-leg handshake and then transforms whole frame
//! payloads in each direction.
//!
//! [`CipherTransform`] is the reference implementation. It agrees on a shared
//! secret with ephemeral X25519 keys, derives one ChaCha20-Poly1305 key per
//! direction with SHA-256, and prefixes every sealed payload with the 8-byte
//! counter used as its nonce. Decryption therefore needs no receive-side
//! counter and retransmitted frames open the same way twice.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::errors::TransformError;
use crate::Result;

// ----------------------------------------------------------------------------
// Transform Contract
// ----------------------------------------------------------------------------

/// Handshake plus in-place payload transform for one session
pub trait BufferTransform: Send {
    /// Initiator, first leg: produce the request data
    fn initialize_handshake(&mut self) -> Result<Vec<u8>>;

    /// Responder, second leg: consume request data and produce the response.
    /// On success the responder can inverse-transform immediately.
    fn handshake(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Initiator, final leg: validate the response
    fn finalize_handshake(&mut self, response: &[u8]) -> bool;

    /// Transform an outbound payload in place
    fn transform(&mut self, buffer: &mut Vec<u8>) -> Result<()>;

    /// Reverse [`transform`](Self::transform) on an inbound payload in place
    fn inverse_transform(&mut self, buffer: &mut Vec<u8>) -> Result<()>;

    /// Fresh, un-keyed instance with the same configuration
    fn boxed_clone(&self) -> Box<dyn BufferTransform>;
}

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

const PUBLIC_KEY_LEN: usize = 32;
const CONFIRM_TAG_LEN: usize = 16;
const COUNTER_LEN: usize = 8;
const NONCE_LEN: usize = 12;

const LABEL_CONFIRM: &[u8] = b"flowlink confirm";
const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"flowlink i2r";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"flowlink r2i";

// ----------------------------------------------------------------------------
// Cipher Transform
// ----------------------------------------------------------------------------

/// X25519 + ChaCha20-Poly1305 channel transform
#[derive(Default)]
pub struct CipherTransform {
    secret: Option<EphemeralSecret>,
    sealer: Option<ChaCha20Poly1305>,
    opener: Option<ChaCha20Poly1305>,
    counter: u64,
}

impl CipherTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether outbound payloads can be sealed
    pub fn can_transform(&self) -> bool {
        self.sealer.is_some()
    }

    /// Whether inbound payloads can be opened
    pub fn can_inverse_transform(&self) -> bool {
        self.opener.is_some()
    }

    fn derive(shared: &[u8], label: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(shared);
        hasher.update(label);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    fn confirm_tag(shared: &[u8]) -> [u8; CONFIRM_TAG_LEN] {
        let digest = Self::derive(shared, LABEL_CONFIRM);
        let mut tag = [0u8; CONFIRM_TAG_LEN];
        tag.copy_from_slice(&digest[..CONFIRM_TAG_LEN]);
        tag
    }

    fn cipher(shared: &[u8], label: &[u8]) -> ChaCha20Poly1305 {
        let key = Self::derive(shared, label);
        ChaCha20Poly1305::new(Key::from_slice(&key))
    }

    fn read_public_key(bytes: &[u8]) -> Result<PublicKey> {
        if bytes.len() < PUBLIC_KEY_LEN {
            return Err(TransformError::InvalidHandshake {
                reason: format!(
                    "expected {} bytes of public key, got {}",
                    PUBLIC_KEY_LEN,
                    bytes.len()
                ),
            }
            .into());
        }
        let mut key = [0u8; PUBLIC_KEY_LEN];
        key.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        Ok(PublicKey::from(key))
    }

    fn nonce(counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[NONCE_LEN - COUNTER_LEN..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }
}

impl BufferTransform for CipherTransform {
    fn initialize_handshake(&mut self) -> Result<Vec<u8>> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.secret = Some(secret);
        Ok(public.as_bytes().to_vec())
    }

    fn handshake(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let peer = Self::read_public_key(request)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(TransformError::InvalidHandshake {
                reason: "non-contributory key agreement".to_string(),
            }
            .into());
        }

        self.opener = Some(Self::cipher(shared.as_bytes(), LABEL_INITIATOR_TO_RESPONDER));
        self.sealer = Some(Self::cipher(shared.as_bytes(), LABEL_RESPONDER_TO_INITIATOR));
        self.counter = 0;

        let mut response = Vec::with_capacity(PUBLIC_KEY_LEN + CONFIRM_TAG_LEN);
        response.extend_from_slice(public.as_bytes());
        response.extend_from_slice(&Self::confirm_tag(shared.as_bytes()));
        Ok(response)
    }

    fn finalize_handshake(&mut self, response: &[u8]) -> bool {
        if response.len() != PUBLIC_KEY_LEN + CONFIRM_TAG_LEN {
            tracing::warn!("Handshake response has {} bytes", response.len());
            return false;
        }
        let Some(secret) = self.secret.take() else {
            tracing::warn!("Handshake finalized before it was initialized");
            return false;
        };
        let Ok(peer) = Self::read_public_key(response) else {
            return false;
        };
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return false;
        }
        if Self::confirm_tag(shared.as_bytes())[..] != response[PUBLIC_KEY_LEN..] {
            tracing::warn!("Handshake confirmation tag mismatch");
            return false;
        }

        self.sealer = Some(Self::cipher(shared.as_bytes(), LABEL_INITIATOR_TO_RESPONDER));
        self.opener = Some(Self::cipher(shared.as_bytes(), LABEL_RESPONDER_TO_INITIATOR));
        self.counter = 0;
        true
    }

    fn transform(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let sealer = self
            .sealer
            .as_ref()
            .ok_or(TransformError::NotReady { direction: "send" })?;
        let counter = self.counter;
        let sealed = sealer
            .encrypt(Nonce::from_slice(&Self::nonce(counter)), buffer.as_slice())
            .map_err(|_| TransformError::EncryptionFailed)?;
        self.counter = counter.wrapping_add(1);

        buffer.clear();
        buffer.extend_from_slice(&counter.to_le_bytes());
        buffer.extend_from_slice(&sealed);
        Ok(())
    }

    fn inverse_transform(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let opener = self
            .opener
            .as_ref()
            .ok_or(TransformError::NotReady { direction: "receive" })?;
        if buffer.len() < COUNTER_LEN {
            return Err(TransformError::DecryptionFailed.into());
        }
        let mut counter = [0u8; COUNTER_LEN];
        counter.copy_from_slice(&buffer[..COUNTER_LEN]);
        let nonce = Self::nonce(u64::from_le_bytes(counter));
        let opened = opener
            .decrypt(Nonce::from_slice(&nonce), &buffer[COUNTER_LEN..])
            .map_err(|_| TransformError::DecryptionFailed)?;
        *buffer = opened;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn BufferTransform> {
        Box::new(CipherTransform::new())
    }
}

impl core::fmt::Debug for CipherTransform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CipherTransform")
            .field("can_transform", &self.can_transform())
            .field("can_inverse_transform", &self.can_inverse_transform())
            .field("counter", &self.counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> (CipherTransform, CipherTransform) {
        let mut initiator = CipherTransform::new();
        let mut responder = CipherTransform::new();

        let request = initiator.initialize_handshake().unwrap();
        let response = responder.handshake(&request).unwrap();
        assert!(responder.can_inverse_transform());
        assert!(initiator.finalize_handshake(&response));
        (initiator, responder)
    }

    #[test]
    fn test_handshake_and_both_directions() {
        let (mut initiator, mut responder) = handshake_pair();

        let mut buffer = b"hello responder".to_vec();
        initiator.transform(&mut buffer).unwrap();
        assert_ne!(&buffer[COUNTER_LEN..], b"hello responder");
        responder.inverse_transform(&mut buffer).unwrap();
        assert_eq!(buffer, b"hello responder");

        let mut buffer = b"hello initiator".to_vec();
        responder.transform(&mut buffer).unwrap();
        initiator.inverse_transform(&mut buffer).unwrap();
        assert_eq!(buffer, b"hello initiator");
    }

    #[test]
    fn test_retransmitted_frame_opens_again() {
        let (mut initiator, mut responder) = handshake_pair();

        let mut sealed = b"payload".to_vec();
        initiator.transform(&mut sealed).unwrap();

        let mut first = sealed.clone();
        let mut second = sealed;
        responder.inverse_transform(&mut first).unwrap();
        responder.inverse_transform(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tampered_response_fails_finalize() {
        let mut initiator = CipherTransform::new();
        let mut responder = CipherTransform::new();

        let request = initiator.initialize_handshake().unwrap();
        let mut response = responder.handshake(&request).unwrap();
        let last = response.len() - 1;
        response[last] ^= 0xff;

        assert!(!initiator.finalize_handshake(&response));
        assert!(!initiator.can_transform());
    }

    #[test]
    fn test_not_ready_before_handshake() {
        let mut transform = CipherTransform::new();
        let mut buffer = vec![1, 2, 3];
        assert!(transform.transform(&mut buffer).is_err());
        assert!(transform.inverse_transform(&mut buffer).is_err());
        assert!(transform.handshake(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_corrupted_payload_fails_to_open() {
        let (mut initiator, mut responder) = handshake_pair();
        let mut buffer = b"payload".to_vec();
        initiator.transform(&mut buffer).unwrap();
        buffer[COUNTER_LEN] ^= 1;
        assert!(responder.inverse_transform(&mut buffer).is_err());
    }
}
