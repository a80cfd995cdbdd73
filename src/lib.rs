#![warn(missing_docs)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]

//! # smartsign
//!
//! Document signing with smart cards and other PKCS#11 tokens.
//!
//! Feed it arbitrary bytes, PDFs or existing PKCS#7 containers and get them
//! back signed with a private key that never leaves the hardware:
//!
//! - **CMS/PKCS#7**: detached or enveloping SignedData with CAdES signed
//!   attributes (message digest, signing time, signingCertificateV2)
//! - **Multi-signer**: existing containers gain a new SignerInfo, prior
//!   signers are carried forward untouched
//! - **PDF**: incremental CAdES signatures (ETSI.CAdES.detached) with
//!   visible widgets, automatic free-area placement and a verification
//!   pass over the produced file
//! - **Discovery**: certificates enumerated across several middleware
//!   modules, deduplicated, with fallback locations probed at signing time
//!
//! ## Quick start
//!
//! ```no_run
//! use smartsign::catalog::CertificateCatalog;
//! use smartsign::orchestrator::{SigningOrchestrator, SigningRequest};
//! use smartsign::token::CryptokiToken;
//! use smartsign::types::{DigestAlgorithm, SignConfig, SignableDocument};
//!
//! # fn main() -> smartsign::Result<()> {
//! let mut token = CryptokiToken::new();
//! let modules = vec!["/usr/lib/opensc-pkcs11.so".to_string()];
//! let catalog = CertificateCatalog::discover(&mut token, &modules, false);
//!
//! let request = SigningRequest {
//!     documents: vec![SignableDocument::new(
//!         "doc-1",
//!         std::fs::read("contract.pdf")?,
//!         SignConfig::default(),
//!     )?],
//!     certificate_id: catalog.entries()[0].display_id.clone(),
//!     pin: "12345".to_string(),
//!     signing_time: None,
//! };
//! let signed = SigningOrchestrator::new(DigestAlgorithm::Sha256)
//!     .sign_documents(&mut token, &catalog, &request)?;
//! std::fs::write("contract-signed.pdf", &signed[0].content)?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod cms;
pub mod error;
pub mod orchestrator;
pub mod pdf;
pub mod token;
pub mod types;
pub mod validation;
pub mod wire;

pub use error::{Error, Result};
pub use types::{
    DigestAlgorithm, OutputFormat, SignConfig, SignPosition, SignableDocument, SignedResult,
};
