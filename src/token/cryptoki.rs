//! PKCS#11 backend built on the `cryptoki` crate.

use std::collections::HashMap;
use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, CertificateType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use log::{debug, info, warn};

use super::{SessionHandle, SlotId, TokenBackend, TokenCertificate};
use crate::error::{Error, Result};

/// Token backend backed by a real PKCS#11 module.
///
/// Holds at most one loaded module at a time; `connect` on a connected
/// backend disconnects first. The Cryptoki context is finalized when the
/// backend disconnects or is dropped.
pub struct CryptokiToken {
    ctx: Option<Pkcs11>,
    module_path: String,
    slots: HashMap<SlotId, Slot>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
}

impl CryptokiToken {
    /// Create a backend with no module loaded.
    pub fn new() -> Self {
        Self {
            ctx: None,
            module_path: String::new(),
            slots: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
        }
    }

    fn ctx(&self) -> Result<&Pkcs11> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::Token("no PKCS#11 module loaded".to_string()))
    }

    fn slot(&self, slot: SlotId) -> Result<Slot> {
        self.slots
            .get(&slot)
            .copied()
            .ok_or_else(|| Error::Token(format!("slot {} is not present", slot)))
    }

    fn connect_err(&self, module: &str, e: impl std::fmt::Display) -> Error {
        Error::TokenConnect { module: module.to_string(), reason: e.to_string() }
    }
}

impl Default for CryptokiToken {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBackend for CryptokiToken {
    fn connect(&mut self, module_path: &str) -> Result<Vec<SlotId>> {
        if self.ctx.is_some() {
            self.disconnect();
        }
        info!("loading PKCS#11 module {}", module_path);
        let ctx = Pkcs11::new(Path::new(module_path))
            .map_err(|e| self.connect_err(module_path, e))?;
        match ctx.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            // Another library user may already have initialized this module.
            Err(Pkcs11Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(e) => return Err(self.connect_err(module_path, e)),
        }
        let slots = ctx
            .get_slots_with_token()
            .map_err(|e| self.connect_err(module_path, e))?;
        // Only slots whose token can actually sign with RSA PKCS#1 v1.5
        // qualify; card readers often expose extra storage-only slots.
        let qualifying: Vec<Slot> = slots
            .into_iter()
            .filter(|slot| match ctx.get_mechanism_info(*slot, MechanismType::RSA_PKCS) {
                Ok(info) => info.sign(),
                Err(e) => {
                    debug!("slot {} has no RSA PKCS mechanism: {}", slot.id(), e);
                    false
                }
            })
            .collect();
        if qualifying.is_empty() {
            return Err(self.connect_err(
                module_path,
                "no slot offers RSA PKCS#1 v1.5 signing",
            ));
        }
        self.slots = qualifying.iter().map(|s| (s.id(), *s)).collect();
        self.module_path = module_path.to_string();
        self.ctx = Some(ctx);
        let mut ids: Vec<SlotId> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        debug!("module {} exposes slots {:?}", module_path, ids);
        Ok(ids)
    }

    fn login(&mut self, slot: SlotId, pin: &str) -> Result<SessionHandle> {
        let slot_obj = self.slot(slot)?;
        let ctx = self.ctx()?;
        let token_info = ctx
            .get_token_info(slot_obj)
            .map_err(|e| Error::TokenLogin { slot, reason: e.to_string() })?;
        let session = ctx
            .open_rw_session(slot_obj)
            .map_err(|e| Error::TokenLogin { slot, reason: e.to_string() })?;

        if token_info.login_required() {
            let login_result = if pin.is_empty() && token_info.protected_authentication_path() {
                // The reader's PIN pad collects the PIN.
                session.login(UserType::User, None)
            } else {
                session.login(UserType::User, Some(&AuthPin::new(pin.to_string())))
            };
            match login_result {
                Ok(()) => {}
                Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
                Err(e) => return Err(Error::TokenLogin { slot, reason: e.to_string() }),
            }
        }

        let handle = SessionHandle(self.next_session);
        self.next_session += 1;
        self.sessions.insert(handle.0, session);
        debug!("opened session {:?} on slot {}", handle, slot);
        Ok(handle)
    }

    fn list_certificates(&mut self, slot: SlotId) -> Result<Vec<TokenCertificate>> {
        let slot_obj = self.slot(slot)?;
        let session = self
            .ctx()?
            .open_ro_session(slot_obj)
            .map_err(|e| Error::Token(format!("cannot open session on slot {}: {}", slot, e)))?;

        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
        ];
        let handles = session
            .find_objects(&template)
            .map_err(|e| Error::Token(format!("certificate search failed: {}", e)))?;

        let mut certs = Vec::with_capacity(handles.len());
        for handle in handles {
            let attrs = session
                .get_attributes(
                    handle,
                    &[AttributeType::Id, AttributeType::Label, AttributeType::Value],
                )
                .map_err(|e| Error::Token(format!("certificate attributes unreadable: {}", e)))?;
            let mut id = Vec::new();
            let mut label = String::new();
            let mut der = Vec::new();
            for attr in attrs {
                match attr {
                    Attribute::Id(v) => id = v,
                    Attribute::Label(v) => label = String::from_utf8_lossy(&v).to_string(),
                    Attribute::Value(v) => der = v,
                    _ => {}
                }
            }
            if der.is_empty() {
                warn!("skipping certificate object with empty CKA_VALUE on slot {}", slot);
                continue;
            }
            certs.push(TokenCertificate { id, label, der });
        }
        debug!("slot {} holds {} certificate(s)", slot, certs.len());
        Ok(certs)
    }

    fn sign(
        &mut self,
        session: SessionHandle,
        key_id: &[u8],
        key_label: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let session = self
            .sessions
            .get(&session.0)
            .ok_or_else(|| Error::Token(format!("session {:?} is not open", session)))?;

        let key = find_signing_key(session, key_id, key_label)?;
        session
            .sign(&Mechanism::RsaPkcs, key, data)
            .map_err(|e| Error::Token(format!("C_Sign failed: {}", e)))
    }

    fn close_session(&mut self, session: SessionHandle) {
        if let Some(s) = self.sessions.remove(&session.0) {
            if let Err(e) = s.logout() {
                debug!("logout on session {:?} failed: {}", session, e);
            }
            // Session closes on drop.
        }
    }

    fn disconnect(&mut self) {
        if self.ctx.is_some() {
            info!("releasing PKCS#11 module {}", self.module_path);
        }
        self.sessions.clear();
        self.slots.clear();
        // Pkcs11 finalizes the library on drop.
        self.ctx = None;
        self.module_path.clear();
    }
}

/// Locate a sign-capable private key by CKA_ID, falling back to CKA_LABEL.
fn find_signing_key(session: &Session, key_id: &[u8], key_label: &[u8]) -> Result<ObjectHandle> {
    let by_id = vec![
        Attribute::Class(ObjectClass::PRIVATE_KEY),
        Attribute::Id(key_id.to_vec()),
    ];
    let by_label = vec![
        Attribute::Class(ObjectClass::PRIVATE_KEY),
        Attribute::Label(key_label.to_vec()),
    ];

    for template in [by_id, by_label] {
        let handles = session
            .find_objects(&template)
            .map_err(|e| Error::Token(format!("private key search failed: {}", e)))?;
        for handle in handles {
            let attrs = session
                .get_attributes(handle, &[AttributeType::Sign])
                .map_err(|e| Error::Token(format!("key attributes unreadable: {}", e)))?;
            let sign_capable = attrs
                .iter()
                .any(|a| matches!(a, Attribute::Sign(true)));
            if sign_capable {
                return Ok(handle);
            }
        }
    }
    Err(Error::KeyNotFound(format!(
        "no sign-capable private key matches id {:02x?} or label {:?}",
        key_id,
        String::from_utf8_lossy(key_label)
    )))
}
