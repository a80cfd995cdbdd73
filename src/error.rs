//! Error types for the signing library.
//!
//! Every component fails with a fully descriptive error that is surfaced
//! unchanged to its caller; there are no automatic retries apart from the
//! documented multi-candidate probing in the orchestrator.

/// Result type alias for signing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while discovering certificates or signing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unusable configuration (no module paths, bad options).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A PKCS#11 module could not be loaded or exposed no usable slot.
    #[error("Failed to connect to token module '{module}': {reason}")]
    TokenConnect {
        /// Path of the module that failed
        module: String,
        /// Why the connection was rejected
        reason: String,
    },

    /// Opening or authenticating a token session failed.
    #[error("Login failed on slot {slot}: {reason}")]
    TokenLogin {
        /// Slot the login was attempted against
        slot: u64,
        /// Failure reason as reported by the token
        reason: String,
    },

    /// No private key on the token matches the requested id/label, or the
    /// matching key is not sign-capable.
    #[error("No usable private key: {0}")]
    KeyNotFound(String),

    /// Every candidate module/slot pair failed the probe signature.
    #[error("Impossible to perform a valid signature with certificate '{subject}'; modules attempted: {}", attempted.join(", "))]
    ProbeExhausted {
        /// Subject of the certificate being probed
        subject: String,
        /// Module paths attempted, in order
        attempted: Vec<String>,
    },

    /// A generic token operation failed.
    #[error("Token operation failed: {0}")]
    Token(String),

    /// CMS/PKCS#7 structure could not be built or parsed.
    #[error("CMS encoding error: {0}")]
    CmsEncoding(String),

    /// A signature inside a container failed cryptographic verification.
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// PDF structure is invalid for incremental signing.
    #[error("Invalid PDF: {0}")]
    PdfStructure(String),

    /// A certificate failed validation in a context where the caller asked
    /// for it to be treated as fatal.
    #[error("Certificate validation failed: {0}")]
    Advisory(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::CmsEncoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_exhausted_lists_all_modules() {
        let err = Error::ProbeExhausted {
            subject: "CN=Mario Rossi".to_string(),
            attempted: vec!["/usr/lib/a.so".to_string(), "/usr/lib/b.so".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("CN=Mario Rossi"));
        assert!(msg.contains("/usr/lib/a.so"));
        assert!(msg.contains("/usr/lib/b.so"));
    }

    #[test]
    fn token_connect_names_module() {
        let err = Error::TokenConnect {
            module: "opensc-pkcs11.so".to_string(),
            reason: "no qualifying slots".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("opensc-pkcs11.so"));
        assert!(msg.contains("no qualifying slots"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
