//! Batch signing orchestration.
//!
//! One signing run owns the token exclusively: a process-wide lock is taken
//! on entry, every candidate module location for the chosen certificate is
//! probed with a throwaway signature, and only then is a session opened and
//! the whole queue signed against a single batch clock. Cleanup runs on
//! every exit path through [`SessionGuard`].

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::catalog::{CertificateCatalog, CertificateEntry};
use crate::cms::{self, CmsBuilder};
use crate::error::{Error, Result};
use crate::pdf::{self, PdfSigner};
use crate::token::{SessionGuard, SlotId, TokenBackend};
use crate::types::{DigestAlgorithm, OutputFormat, SignableDocument, SignedResult};
use crate::validation;

/// Payload signed during probing; the result is discarded after
/// verification against the certificate's public key.
const PROBE_PAYLOAD: &[u8] = b"test";

// Signing drives a physical token; two concurrent runs would interleave
// C_Login/C_Sign calls on the same device.
static SIGN_GUARD: Mutex<()> = Mutex::new(());

/// A signing run: which certificate, which documents, which clock.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Documents to sign, in order.
    pub documents: Vec<SignableDocument>,
    /// Display id of the catalog entry to sign with.
    pub certificate_id: String,
    /// Token PIN; empty means protected authentication path.
    pub pin: String,
    /// Batch clock. Every document in the run gets this signing time;
    /// `None` freezes the current time at the start of the run.
    pub signing_time: Option<DateTime<Utc>>,
}

/// The module location and key that survived probing.
struct ProbedLocation {
    slot: SlotId,
    key_id: Vec<u8>,
    key_label: String,
}

/// Drives discovery-independent batch signing.
#[derive(Debug, Clone, Copy)]
pub struct SigningOrchestrator {
    algorithm: DigestAlgorithm,
}

impl SigningOrchestrator {
    /// Orchestrator using `algorithm` for every container it produces.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Sign every document in the request with the chosen certificate.
    ///
    /// Results come back in submission order. The run is atomic with
    /// respect to the token: it holds the process-wide signing lock and a
    /// single authenticated session for its whole duration.
    pub fn sign_documents(
        &self,
        backend: &mut dyn TokenBackend,
        catalog: &CertificateCatalog,
        request: &SigningRequest,
    ) -> Result<Vec<SignedResult>> {
        let _lock = SIGN_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if request.documents.is_empty() {
            return Err(Error::Config("no documents to sign".to_string()));
        }
        let entry = catalog.find_by_id(&request.certificate_id).ok_or_else(|| {
            Error::Config(format!(
                "certificate '{}' is not in the catalog",
                request.certificate_id
            ))
        })?;

        let batch_time = request.signing_time.unwrap_or_else(Utc::now);
        for advisory in validation::check_certificate(&entry.der, batch_time, None) {
            warn!("certificate advisory: {}", advisory);
        }

        let location = self.probe(backend, entry, &request.pin)?;
        let mut guard = SessionGuard::open(backend, location.slot, &request.pin)?;

        let mut results = Vec::with_capacity(request.documents.len());
        for doc in &request.documents {
            let result = self.sign_one(&mut guard, &location, entry, doc, batch_time)?;
            results.push(result);
        }
        info!("signed {} document(s)", results.len());
        Ok(results)
    }

    /// Try every module location of `entry` until one produces a signature
    /// that verifies against the certificate. Leaves the backend connected
    /// to the winning module.
    fn probe(
        &self,
        backend: &mut dyn TokenBackend,
        entry: &CertificateEntry,
        pin: &str,
    ) -> Result<ProbedLocation> {
        let mut attempted = Vec::new();
        for candidate in candidates(entry) {
            attempted.push(candidate.module_path.clone());
            let slots = match backend.connect(&candidate.module_path) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!("probe: {} failed to connect: {}", candidate.module_path, e);
                    backend.disconnect();
                    continue;
                }
            };
            if !slots.contains(&candidate.slot) {
                warn!(
                    "probe: {} no longer exposes slot {}",
                    candidate.module_path, candidate.slot
                );
                backend.disconnect();
                continue;
            }
            match self.try_probe(backend, candidate.slot, pin, &candidate, entry) {
                Ok(()) => {
                    info!(
                        "probe: signing through {} slot {}",
                        candidate.module_path, candidate.slot
                    );
                    return Ok(ProbedLocation {
                        slot: candidate.slot,
                        key_id: candidate.key_id,
                        key_label: candidate.key_label,
                    });
                }
                Err(e) => {
                    warn!("probe: {} rejected: {}", candidate.module_path, e);
                    backend.disconnect();
                }
            }
        }
        Err(Error::ProbeExhausted {
            subject: validation::subject_name(&entry.der),
            attempted,
        })
    }

    fn try_probe(
        &self,
        backend: &mut dyn TokenBackend,
        slot: SlotId,
        pin: &str,
        candidate: &Candidate,
        entry: &CertificateEntry,
    ) -> Result<()> {
        let session = backend.login(slot, pin)?;
        let outcome = (|| {
            let digest = self.algorithm.digest(PROBE_PAYLOAD);
            let digest_info = cms::digest_info(self.algorithm, &digest)?;
            let signature = backend.sign(
                session,
                &candidate.key_id,
                candidate.key_label.as_bytes(),
                &digest_info,
            )?;
            if !validation::verify_rsa_pkcs1v15(
                &entry.der,
                self.algorithm,
                PROBE_PAYLOAD,
                &signature,
            ) {
                return Err(Error::Verification(
                    "probe signature does not verify against the certificate".to_string(),
                ));
            }
            Ok(())
        })();
        backend.close_session(session);
        outcome
    }

    /// Classify one document and produce its signed form.
    fn sign_one(
        &self,
        guard: &mut SessionGuard<'_>,
        location: &ProbedLocation,
        entry: &CertificateEntry,
        doc: &SignableDocument,
        batch_time: DateTime<Utc>,
    ) -> Result<SignedResult> {
        let key_id = location.key_id.clone();
        let key_label = location.key_label.clone();
        let mut sign_fn =
            |data: &[u8]| guard.sign(&key_id, key_label.as_bytes(), data);
        let builder = CmsBuilder::new(self.algorithm);

        let (content, format) = if cms::is_signed_data(&doc.content) {
            let out =
                builder.resign(&doc.content, None, &entry.der, Some(batch_time), &mut sign_fn)?;
            (out, OutputFormat::Pkcs7)
        } else if pdf::is_pdf(&doc.content) && !doc.config.sign_pdf_as_p7m {
            let signer = PdfSigner::new(self.algorithm);
            let out =
                signer.sign(&doc.content, &entry.der, &doc.config, batch_time, &mut sign_fn)?;
            (out, OutputFormat::Pdf)
        } else {
            let out = builder.sign(
                &doc.content,
                &entry.der,
                Some(batch_time),
                false,
                &mut sign_fn,
            )?;
            (out, OutputFormat::Pkcs7)
        };
        Ok(SignedResult { id: doc.id.clone(), content, format })
    }
}

struct Candidate {
    module_path: String,
    slot: SlotId,
    key_id: Vec<u8>,
    key_label: String,
}

/// Primary location first, then the alternatives in discovery order.
fn candidates(entry: &CertificateEntry) -> Vec<Candidate> {
    let mut out = vec![Candidate {
        module_path: entry.module_path.clone(),
        slot: entry.slot,
        key_id: entry.key_id.clone(),
        key_label: entry.key_label.clone(),
    }];
    for alt in &entry.alternatives {
        out.push(Candidate {
            module_path: alt.module_path.clone(),
            slot: alt.slot,
            key_id: alt.key_id.clone(),
            key_label: alt.key_label.clone(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::soft::{SoftKey, SoftToken};
    use crate::types::SignConfig;
    use rsa::RsaPrivateKey;

    fn soft_key(id: &[u8], label: &str, cert: &[u8]) -> SoftKey {
        let mut rng = rand::thread_rng();
        SoftKey {
            id: id.to_vec(),
            label: label.to_string(),
            cert_der: cert.to_vec(),
            private_key: RsaPrivateKey::new(&mut rng, 512).unwrap(),
            sign_capable: true,
        }
    }

    fn doc(id: &str) -> SignableDocument {
        SignableDocument::new(id, b"payload".to_vec(), SignConfig::default()).unwrap()
    }

    #[test]
    fn empty_queue_is_rejected() {
        let orchestrator = SigningOrchestrator::new(DigestAlgorithm::Sha256);
        let mut token = SoftToken::new();
        let catalog = CertificateCatalog::default();
        let request = SigningRequest {
            documents: vec![],
            certificate_id: "0: x".to_string(),
            pin: String::new(),
            signing_time: None,
        };
        let err = orchestrator
            .sign_documents(&mut token, &catalog, &request)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_certificate_is_rejected() {
        let orchestrator = SigningOrchestrator::new(DigestAlgorithm::Sha256);
        let mut token = SoftToken::new();
        let catalog = CertificateCatalog::default();
        let request = SigningRequest {
            documents: vec![doc("a")],
            certificate_id: "missing".to_string(),
            pin: String::new(),
            signing_time: None,
        };
        let err = orchestrator
            .sign_documents(&mut token, &catalog, &request)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn probe_exhaustion_names_every_module() {
        // The junk certificate can never verify a probe signature, so every
        // location is attempted and reported.
        let mut token = SoftToken::new();
        token.add_slot(0, false, false, "");
        token.add_key(0, soft_key(b"k", "l", b"JUNK-CERT"));

        let catalog = CertificateCatalog::discover(
            &mut token,
            &["/usr/lib/a.so".to_string(), "/usr/lib/b.so".to_string()],
            true,
        );
        assert_eq!(catalog.len(), 1);
        let entry = &catalog.entries()[0];
        assert_eq!(entry.alternatives.len(), 1);

        let orchestrator = SigningOrchestrator::new(DigestAlgorithm::Sha256);
        let request = SigningRequest {
            documents: vec![doc("a")],
            certificate_id: entry.display_id.clone(),
            pin: String::new(),
            signing_time: None,
        };
        let err = orchestrator
            .sign_documents(&mut token, &catalog, &request)
            .unwrap_err();
        match err {
            Error::ProbeExhausted { attempted, .. } => {
                assert_eq!(attempted, vec!["/usr/lib/a.so", "/usr/lib/b.so"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!token.is_connected());
    }
}
