//! Hardware token access.
//!
//! [`TokenBackend`] is the seam between the signing pipeline and PKCS#11:
//! the production implementation wraps a Cryptoki module, while
//! [`SoftToken`](soft::SoftToken) provides an in-memory token for tests and
//! development. Sessions are identified by opaque handles so callers never
//! hold a reference into the backend's internals.

mod cryptoki;
pub mod soft;

pub use self::cryptoki::CryptokiToken;

use log::debug;

use crate::error::Result;

/// Identifier of a token slot, as reported by the module.
pub type SlotId = u64;

/// Opaque handle to an open, authenticated token session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) u64);

/// A certificate object read from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCertificate {
    /// CKA_ID of the certificate object, shared with its key pair.
    pub id: Vec<u8>,
    /// CKA_LABEL, may be empty.
    pub label: String,
    /// DER-encoded X.509 certificate (CKA_VALUE).
    pub der: Vec<u8>,
}

/// Abstraction over a PKCS#11 module.
///
/// `close_session` and `disconnect` are deliberately infallible: cleanup
/// failures are logged by the implementation and swallowed, and calling
/// either on an already-released resource is a no-op.
pub trait TokenBackend {
    /// Load the module at `module_path` and return the slots that hold a
    /// token. Reconnecting while connected tears down the previous state
    /// first.
    fn connect(&mut self, module_path: &str) -> Result<Vec<SlotId>>;

    /// Open a session on `slot` and authenticate. An empty PIN is forwarded
    /// as a protected-authentication-path login (PIN pad on the reader).
    fn login(&mut self, slot: SlotId, pin: &str) -> Result<SessionHandle>;

    /// Read every X.509 certificate object stored on `slot`.
    fn list_certificates(&mut self, slot: SlotId) -> Result<Vec<TokenCertificate>>;

    /// Sign `data` with raw RSA PKCS#1 v1.5 (CKM_RSA_PKCS) using the private
    /// key whose CKA_ID matches `key_id`, falling back to a CKA_LABEL match
    /// on `key_label`. `data` is expected to be a DER DigestInfo.
    fn sign(
        &mut self,
        session: SessionHandle,
        key_id: &[u8],
        key_label: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Close a session. Idempotent.
    fn close_session(&mut self, session: SessionHandle);

    /// Release the module. Idempotent.
    fn disconnect(&mut self);
}

/// Closes the session and releases the module when dropped.
///
/// Batch signing opens exactly one guard per run; every exit path, including
/// panics inside document processing, funnels through [`Drop`] so the token
/// is never left with a dangling login.
pub struct SessionGuard<'a> {
    backend: &'a mut dyn TokenBackend,
    session: SessionHandle,
}

impl<'a> SessionGuard<'a> {
    /// Authenticate against `slot` on an already connected backend.
    ///
    /// On login failure the backend is disconnected before the error is
    /// returned, so a failed open never leaks module state.
    pub fn open(backend: &'a mut dyn TokenBackend, slot: SlotId, pin: &str) -> Result<Self> {
        match backend.login(slot, pin) {
            Ok(session) => Ok(Self { backend, session }),
            Err(e) => {
                backend.disconnect();
                Err(e)
            }
        }
    }

    /// The handle of the guarded session.
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    /// Sign through the guarded session. See [`TokenBackend::sign`].
    pub fn sign(&mut self, key_id: &[u8], key_label: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.backend.sign(self.session, key_id, key_label, data)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        debug!("releasing token session");
        self.backend.close_session(self.session);
        self.backend.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::soft::SoftToken;
    use super::*;
    use crate::error::Error;

    #[test]
    fn guard_disconnects_on_login_failure() {
        let mut token = SoftToken::new();
        token.add_slot(7, true, false, "1234");
        token.connect("soft").unwrap();

        let err = SessionGuard::open(&mut token, 7, "wrong").err().unwrap();
        assert!(matches!(err, Error::TokenLogin { slot: 7, .. }));
        assert!(!token.is_connected());
    }

    #[test]
    fn guard_drop_closes_session_and_disconnects() {
        let mut token = SoftToken::new();
        token.add_slot(1, false, false, "");
        token.connect("soft").unwrap();
        {
            let guard = SessionGuard::open(&mut token, 1, "").unwrap();
            let _ = guard.session();
        }
        assert_eq!(token.open_session_count(), 0);
        assert!(!token.is_connected());
    }
}
