//! Certificate discovery across candidate PKCS#11 modules.
//!
//! Every candidate module is loaded in turn and its slots enumerated; the
//! certificates found are deduplicated by DER equality so the same identity
//! reachable through several middleware libraries shows up once, with the
//! other homes kept as alternatives for signing-time fallback.

use log::{debug, info, warn};

use crate::token::{SlotId, TokenBackend};
use crate::validation;

/// A certificate discovered on a token, with everything needed to sign
/// with its private key later.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    /// Catalog display identifier, `"<seq>: <CN>    Org:<O>"`.
    pub display_id: String,
    /// DER-encoded certificate.
    pub der: Vec<u8>,
    /// CKA_ID of the key pair.
    pub key_id: Vec<u8>,
    /// CKA_LABEL of the key pair.
    pub key_label: String,
    /// Module the certificate was first found through.
    pub module_path: String,
    /// Slot of that module the certificate was enumerated on.
    pub slot: SlotId,
    /// The same certificate as seen through other modules or slots.
    pub alternatives: Vec<CertificateSource>,
}

/// An additional module/slot location holding an already catalogued
/// certificate.
#[derive(Debug, Clone)]
pub struct CertificateSource {
    /// Module path of the alternative location.
    pub module_path: String,
    /// Slot exposing the certificate there.
    pub slot: SlotId,
    /// CKA_ID at that location.
    pub key_id: Vec<u8>,
    /// CKA_LABEL at that location.
    pub key_label: String,
}

/// The deduplicated set of certificates found across all candidate modules.
#[derive(Debug, Clone, Default)]
pub struct CertificateCatalog {
    entries: Vec<CertificateEntry>,
}

impl CertificateCatalog {
    /// Enumerate `module_paths` and build the catalog.
    ///
    /// Unless `read_all` is set, only certificates whose key usage allows
    /// digitalSignature or nonRepudiation are kept. Modules that fail to
    /// load are logged and skipped; the backend is disconnected before
    /// returning.
    pub fn discover(
        backend: &mut dyn TokenBackend,
        module_paths: &[String],
        read_all: bool,
    ) -> Self {
        let mut catalog = CertificateCatalog::default();
        for module in module_paths {
            let slots = match backend.connect(module) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!("skipping module {}: {}", module, e);
                    continue;
                }
            };
            for slot in &slots {
                let certs = match backend.list_certificates(*slot) {
                    Ok(certs) => certs,
                    Err(e) => {
                        warn!("cannot read slot {} of {}: {}", slot, module, e);
                        continue;
                    }
                };
                for cert in certs {
                    if !read_all && !validation::has_signing_usage(&cert.der) {
                        debug!("discarding certificate without signing usage");
                        continue;
                    }
                    catalog.absorb(module, *slot, cert.id, cert.label, cert.der);
                }
            }
            backend.disconnect();
        }
        backend.disconnect();
        info!("catalog holds {} certificate(s)", catalog.entries.len());
        catalog
    }

    /// Record one certificate occurrence, merging duplicates by DER. Each
    /// occurrence keeps the exact slot it was enumerated on.
    fn absorb(
        &mut self,
        module: &str,
        slot: SlotId,
        key_id: Vec<u8>,
        key_label: String,
        der: Vec<u8>,
    ) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.der == der) {
            existing.alternatives.push(CertificateSource {
                module_path: module.to_string(),
                slot,
                key_id,
                key_label,
            });
            return;
        }
        let seq = self.entries.len();
        let display_id = display_id(seq, &der);
        self.entries.push(CertificateEntry {
            display_id,
            der,
            key_id,
            key_label,
            module_path: module.to_string(),
            slot,
            alternatives: Vec::new(),
        });
    }

    /// All catalogued certificates, in discovery order.
    pub fn entries(&self) -> &[CertificateEntry] {
        &self.entries
    }

    /// Whether discovery found anything.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct certificates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up an entry by its display identifier. Read-only.
    pub fn find_by_id(&self, display_id: &str) -> Option<&CertificateEntry> {
        self.entries.iter().find(|e| e.display_id == display_id)
    }

    /// Pick the entry best suited for signing: nonRepudiation wins over
    /// plain digitalSignature. `None` when no entry is usable for either.
    pub fn select_preferred(&self) -> Option<&CertificateEntry> {
        self.entries
            .iter()
            .find(|e| validation::is_non_repudiation(&e.der))
            .or_else(|| self.entries.iter().find(|e| validation::is_for_signing(&e.der)))
    }
}

/// Format the catalog display id for the certificate at position `seq`.
fn display_id(seq: usize, der: &[u8]) -> String {
    let cn = validation::subject_common_name(der);
    let org = validation::subject_organization(der).unwrap_or_else(|| "Not Defined".to_string());
    format!("{}: {}    Org:{}", seq, cn, org)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::soft::SoftToken;

    fn catalog_from(token: &mut SoftToken, modules: &[&str]) -> CertificateCatalog {
        let modules: Vec<String> = modules.iter().map(|m| m.to_string()).collect();
        CertificateCatalog::discover(token, &modules, true)
    }

    fn key(id: &[u8], label: &str, der: &[u8]) -> crate::token::soft::SoftKey {
        use rsa::RsaPrivateKey;
        // Tiny key, only structural catalog behavior is under test here.
        let mut rng = rand::thread_rng();
        crate::token::soft::SoftKey {
            id: id.to_vec(),
            label: label.to_string(),
            cert_der: der.to_vec(),
            private_key: RsaPrivateKey::new(&mut rng, 512).unwrap(),
            sign_capable: true,
        }
    }

    #[test]
    fn duplicate_der_collapses_into_alternatives() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.add_key(0, key(b"k1", "first", b"SAME-CERT"));
        token.add_key(0, key(b"k2", "second", b"SAME-CERT"));
        token.add_key(0, key(b"k3", "third", b"OTHER-CERT"));

        let catalog = catalog_from(&mut token, &["m"]);
        assert_eq!(catalog.len(), 2);
        let first = &catalog.entries()[0];
        assert_eq!(first.key_label, "first");
        assert_eq!(first.alternatives.len(), 1);
        assert_eq!(first.alternatives[0].key_label, "second");
    }

    #[test]
    fn find_by_id_does_not_mutate() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.add_key(0, key(b"k1", "only", b"CERT"));
        let catalog = catalog_from(&mut token, &["m"]);

        let id = catalog.entries()[0].display_id.clone();
        let before = catalog.len();
        assert!(catalog.find_by_id(&id).is_some());
        assert!(catalog.find_by_id("9999: nobody").is_none());
        assert_eq!(catalog.len(), before);
    }

    #[test]
    fn entry_records_the_slot_it_was_found_on() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.add_slot(1, false, false, "");
        token.add_key(1, key(b"k1", "later", b"CERT"));

        let catalog = catalog_from(&mut token, &["m"]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.entries()[0].slot, 1);
    }

    #[test]
    fn no_signing_capable_entry_means_no_preference() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        // Junk DER parses as neither nonRepudiation nor digitalSignature.
        token.add_key(0, key(b"k1", "only", b"CERT"));
        let catalog = catalog_from(&mut token, &["m"]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.select_preferred().is_none());
    }

    #[test]
    fn unparseable_subject_falls_back_to_not_defined() {
        assert_eq!(display_id(0, b"junk"), "0:     Org:Not Defined");
    }

    #[test]
    fn failing_module_is_skipped_and_backend_released() {
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.add_key(0, key(b"k", "l", b"CERT"));
        token.accept_module("good");

        let catalog = catalog_from(&mut token, &["missing", "good"]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(token.connect_attempts(), &["missing".to_string(), "good".to_string()]);
        assert!(!token.is_connected());
    }
}
