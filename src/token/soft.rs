//! In-memory token backend.
//!
//! Behaves like a PKCS#11 module without any hardware: slots, PIN policy,
//! certificate objects and RSA signing are all simulated. Used by the test
//! suite and handy for developing against the pipeline without a reader.

use std::collections::HashMap;

use log::debug;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};

use super::{SessionHandle, SlotId, TokenBackend, TokenCertificate};
use crate::error::{Error, Result};

/// A key pair stored on a [`SoftToken`] slot.
pub struct SoftKey {
    /// CKA_ID shared by the certificate and private key objects.
    pub id: Vec<u8>,
    /// CKA_LABEL shared by the certificate and private key objects.
    pub label: String,
    /// DER-encoded certificate.
    pub cert_der: Vec<u8>,
    /// The private half, kept in memory.
    pub private_key: RsaPrivateKey,
    /// CKA_SIGN on the private key object.
    pub sign_capable: bool,
}

struct SoftSlot {
    login_required: bool,
    protected_auth_path: bool,
    pin: String,
    keys: Vec<SoftKey>,
}

/// Software token with configurable slots, PINs and failure modes.
#[derive(Default)]
pub struct SoftToken {
    slots: HashMap<SlotId, SoftSlot>,
    // Module paths this token answers to; empty accepts any path.
    known_modules: Vec<String>,
    // Paths that fail to connect even when otherwise known.
    rejected_modules: Vec<String>,
    connected: Option<String>,
    connect_attempts: Vec<String>,
    sessions: HashMap<u64, SlotId>,
    next_session: u64,
    break_signatures: bool,
}

impl SoftToken {
    /// An empty token that accepts any module path.
    pub fn new() -> Self {
        Self { next_session: 1, ..Self::default() }
    }

    /// Add a slot with the given PIN policy.
    pub fn add_slot(
        &mut self,
        id: SlotId,
        login_required: bool,
        protected_auth_path: bool,
        pin: &str,
    ) {
        self.slots.insert(
            id,
            SoftSlot {
                login_required,
                protected_auth_path,
                pin: pin.to_string(),
                keys: Vec::new(),
            },
        );
    }

    /// Store a key pair on `slot`.
    pub fn add_key(&mut self, slot: SlotId, key: SoftKey) {
        if let Some(s) = self.slots.get_mut(&slot) {
            s.keys.push(key);
        }
    }

    /// Restrict the token to answer only for `path`; other module paths fail
    /// to connect. May be called repeatedly to allow several paths.
    pub fn accept_module(&mut self, path: &str) {
        self.known_modules.push(path.to_string());
    }

    /// Make `path` fail to connect from now on, simulating middleware that
    /// was removed or broke between discovery and signing.
    pub fn reject_module(&mut self, path: &str) {
        self.rejected_modules.push(path.to_string());
    }

    /// Make every signature come out invalid, for probe-failure scenarios.
    pub fn break_signatures(&mut self, broken: bool) {
        self.break_signatures = broken;
    }

    /// Whether a module is currently loaded.
    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Number of sessions currently open.
    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every module path `connect` was called with, in order.
    pub fn connect_attempts(&self) -> &[String] {
        &self.connect_attempts
    }

    fn slot(&self, slot: SlotId) -> Result<&SoftSlot> {
        self.slots
            .get(&slot)
            .ok_or_else(|| Error::Token(format!("slot {} is not present", slot)))
    }
}

impl TokenBackend for SoftToken {
    fn connect(&mut self, module_path: &str) -> Result<Vec<SlotId>> {
        if self.connected.is_some() {
            self.disconnect();
        }
        self.connect_attempts.push(module_path.to_string());
        if self.rejected_modules.iter().any(|m| m == module_path)
            || (!self.known_modules.is_empty()
                && !self.known_modules.iter().any(|m| m == module_path))
        {
            return Err(Error::TokenConnect {
                module: module_path.to_string(),
                reason: "module not found".to_string(),
            });
        }
        if self.slots.is_empty() {
            return Err(Error::TokenConnect {
                module: module_path.to_string(),
                reason: "no slot holds a token".to_string(),
            });
        }
        self.connected = Some(module_path.to_string());
        let mut ids: Vec<SlotId> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn login(&mut self, slot: SlotId, pin: &str) -> Result<SessionHandle> {
        if self.connected.is_none() {
            return Err(Error::Token("no module loaded".to_string()));
        }
        let s = self.slot(slot)?;
        if s.login_required {
            let pad_login = pin.is_empty() && s.protected_auth_path;
            if !pad_login && pin != s.pin {
                return Err(Error::TokenLogin {
                    slot,
                    reason: "CKR_PIN_INCORRECT".to_string(),
                });
            }
        }
        let handle = SessionHandle(self.next_session);
        self.next_session += 1;
        self.sessions.insert(handle.0, slot);
        Ok(handle)
    }

    fn list_certificates(&mut self, slot: SlotId) -> Result<Vec<TokenCertificate>> {
        if self.connected.is_none() {
            return Err(Error::Token("no module loaded".to_string()));
        }
        Ok(self
            .slot(slot)?
            .keys
            .iter()
            .map(|k| TokenCertificate {
                id: k.id.clone(),
                label: k.label.clone(),
                der: k.cert_der.clone(),
            })
            .collect())
    }

    fn sign(
        &mut self,
        session: SessionHandle,
        key_id: &[u8],
        key_label: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let slot = *self
            .sessions
            .get(&session.0)
            .ok_or_else(|| Error::Token(format!("session {:?} is not open", session)))?;
        let s = self.slot(slot)?;
        let key = s
            .keys
            .iter()
            .find(|k| k.sign_capable && k.id == key_id)
            .or_else(|| {
                s.keys
                    .iter()
                    .find(|k| k.sign_capable && k.label.as_bytes() == key_label)
            })
            .ok_or_else(|| {
                Error::KeyNotFound(format!(
                    "no sign-capable private key matches id {:02x?} or label {:?}",
                    key_id,
                    String::from_utf8_lossy(key_label)
                ))
            })?;
        if self.break_signatures {
            debug!("producing a deliberately invalid signature");
            return Ok(vec![0u8; key.private_key.size()]);
        }
        // CKM_RSA_PKCS pads the caller-supplied DigestInfo directly.
        key.private_key
            .sign(Pkcs1v15Sign::new_unprefixed(), data)
            .map_err(|e| Error::Token(format!("RSA signing failed: {}", e)))
    }

    fn close_session(&mut self, session: SessionHandle) {
        self.sessions.remove(&session.0);
    }

    fn disconnect(&mut self) {
        self.sessions.clear();
        self.connected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_module_is_rejected() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.accept_module("/usr/lib/good.so");
        assert!(token.connect("/usr/lib/bad.so").is_err());
        assert!(token.connect("/usr/lib/good.so").is_ok());
        assert_eq!(token.connect_attempts().len(), 2);
    }

    #[test]
    fn protected_path_accepts_empty_pin() {
        let mut token = SoftToken::new();
        token.add_slot(3, true, true, "8765");
        token.connect("any").unwrap();
        assert!(token.login(3, "").is_ok());
        assert!(token.login(3, "8765").is_ok());
        assert!(token.login(3, "1111").is_err());
    }

    #[test]
    fn sign_without_matching_key_is_key_not_found() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.connect("any").unwrap();
        let session = token.login(0, "").unwrap();
        let err = token.sign(session, b"id", b"label", b"data").unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }
}
