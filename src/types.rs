//! Core data types shared across the signing pipeline.

use der::asn1::ObjectIdentifier;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Digest algorithm used throughout the digest chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// SHA-256 (default, the algorithm hardware tokens are probed with)
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl DigestAlgorithm {
    /// Get the OID for this digest algorithm.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha256 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1"),
            DigestAlgorithm::Sha384 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2"),
            DigestAlgorithm::Sha512 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3"),
        }
    }

    /// Look up the algorithm for a digest OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [DigestAlgorithm::Sha256, DigestAlgorithm::Sha384, DigestAlgorithm::Sha512]
            .into_iter()
            .find(|alg| alg.oid() == *oid)
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Compute the digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Where to place a visible signature widget on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignPosition {
    /// Automatically pick a free rectangle near the bottom-left.
    #[default]
    Auto,
    /// Fixed rectangle on the left side of the page.
    Left,
    /// Fixed rectangle on the right side of the page.
    Right,
}

impl SignPosition {
    /// Parse the wire representation (`""`, `"left"`, `"right"`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" => Ok(SignPosition::Auto),
            "left" => Ok(SignPosition::Left),
            "right" => Ok(SignPosition::Right),
            other => Err(Error::Config(format!("unknown signPosition '{}'", other))),
        }
    }
}

/// Per-document signing options.
#[derive(Debug, Clone, Copy)]
pub struct SignConfig {
    /// Force an enveloping PKCS#7 even when the input is a PDF.
    pub sign_pdf_as_p7m: bool,
    /// Draw a signature widget on the signed page.
    pub visible_signature: bool,
    /// 1-based page to sign; values <= 0 mean the last page.
    pub page_num_to_sign: i32,
    /// Placement of the visible signature.
    pub sign_position: SignPosition,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            sign_pdf_as_p7m: false,
            visible_signature: true,
            page_num_to_sign: -1,
            sign_position: SignPosition::Auto,
        }
    }
}

/// A document queued for signing.
#[derive(Debug, Clone)]
pub struct SignableDocument {
    /// Caller-assigned identifier, echoed back in the result.
    pub id: String,
    /// Raw content bytes (arbitrary, PDF, or an existing PKCS#7 container).
    pub content: Vec<u8>,
    /// Signing options for this document.
    pub config: SignConfig,
}

impl SignableDocument {
    /// Create a document, validating that id and content are non-empty.
    pub fn new(id: impl Into<String>, content: Vec<u8>, config: SignConfig) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Config("document id must be defined".to_string()));
        }
        if content.is_empty() {
            return Err(Error::Config(format!("document '{}' has no content", id)));
        }
        Ok(Self { id, content, config })
    }
}

/// Output format actually produced for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// PDF with an embedded CAdES signature.
    Pdf,
    /// DER CMS ContentInfo, conventionally saved as `.p7m`.
    Pkcs7,
}

/// A signed document handed back to the caller.
#[derive(Debug, Clone)]
pub struct SignedResult {
    /// Identifier of the source document.
    pub id: String,
    /// Final signed bytes.
    pub content: Vec<u8>,
    /// Format the signer actually produced.
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_algorithm_oids() {
        assert_eq!(DigestAlgorithm::Sha256.oid().to_string(), "2.16.840.1.101.3.4.2.1");
        assert_eq!(DigestAlgorithm::Sha256.name(), "SHA-256");
        assert_eq!(DigestAlgorithm::Sha256.digest(b"abc").len(), 32);
        assert_eq!(DigestAlgorithm::Sha512.digest(b"abc").len(), 64);
    }

    #[test]
    fn sign_position_parses_wire_values() {
        assert_eq!(SignPosition::parse("").unwrap(), SignPosition::Auto);
        assert_eq!(SignPosition::parse("Left").unwrap(), SignPosition::Left);
        assert_eq!(SignPosition::parse("right").unwrap(), SignPosition::Right);
        assert!(SignPosition::parse("center").is_err());
    }

    #[test]
    fn sign_config_defaults() {
        let cfg = SignConfig::default();
        assert!(!cfg.sign_pdf_as_p7m);
        assert!(cfg.visible_signature);
        assert_eq!(cfg.page_num_to_sign, -1);
        assert_eq!(cfg.sign_position, SignPosition::Auto);
    }

    #[test]
    fn document_requires_id_and_content() {
        assert!(SignableDocument::new("", vec![1], SignConfig::default()).is_err());
        assert!(SignableDocument::new("a", vec![], SignConfig::default()).is_err());
        assert!(SignableDocument::new("a", vec![1], SignConfig::default()).is_ok());
    }
}
