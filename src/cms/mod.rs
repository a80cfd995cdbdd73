//! CMS/PKCS#7 container assembly and verification.
//!
//! Containers are built with the RustCrypto `cms` structures rather than
//! hand-rolled DER. The builder produces SignedData with CAdES signed
//! attributes; resigning parses an existing container and appends a new
//! SignerInfo while carrying every prior signer forward untouched.

mod builder;
mod verify;

pub use builder::{CmsBuilder, PreparedSignature};
pub use verify::{verify_detached, verify_enveloping};

use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Any, Decode, Encode, Sequence};
use spki::AlgorithmIdentifierOwned;

use crate::error::{Error, Result};
use crate::types::DigestAlgorithm;

/// id-data
pub(crate) const OID_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// id-signedData
pub(crate) const OID_SIGNED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
/// id-contentType
pub(crate) const OID_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
/// id-messageDigest
pub(crate) const OID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
/// id-signingTime
pub(crate) const OID_SIGNING_TIME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
/// id-aa-signingCertificateV2
pub(crate) const OID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");
/// rsaEncryption
pub(crate) const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Re-encode any DER value as an `Any`.
pub(crate) fn any_from<T: Encode>(value: &T) -> Result<Any> {
    Ok(Any::from_der(&value.to_der()?)?)
}

/// DigestInfo handed to CKM_RSA_PKCS, which adds only the PKCS#1 padding.
#[derive(Debug, Sequence)]
pub(crate) struct DigestInfo {
    pub algorithm: AlgorithmIdentifierOwned,
    pub digest: OctetString,
}

/// DER-encoded DigestInfo over an already computed digest. This is the final
/// link of the digest chain before the token applies the raw RSA operation.
///
/// The AlgorithmIdentifier parameters must be an explicit NULL: that is the
/// RFC 8017 encoding every PKCS#1 v1.5 verifier reconstructs.
pub fn digest_info(algorithm: DigestAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
    let info = DigestInfo {
        algorithm: AlgorithmIdentifierOwned {
            oid: algorithm.oid(),
            parameters: Some(Any::null()),
        },
        digest: OctetString::new(digest)?,
    };
    Ok(info.to_der()?)
}

/// Whether `bytes` already parse as a CMS SignedData container.
pub fn is_signed_data(bytes: &[u8]) -> bool {
    match ContentInfo::from_der(bytes) {
        Ok(ci) => ci.content_type == OID_SIGNED_DATA,
        Err(_) => false,
    }
}

pub(crate) fn decode_signed_data(bytes: &[u8]) -> Result<SignedData> {
    let ci = ContentInfo::from_der(bytes)
        .map_err(|e| Error::CmsEncoding(format!("not a CMS container: {}", e)))?;
    if ci.content_type != OID_SIGNED_DATA {
        return Err(Error::CmsEncoding(format!(
            "unexpected content type {}",
            ci.content_type
        )));
    }
    Ok(ci.content.decode_as::<SignedData>()?)
}

/// Content embedded in an enveloping SignedData, `None` for detached ones.
pub fn encapsulated_content(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let sd = decode_signed_data(bytes)?;
    match sd.encap_content_info.econtent {
        Some(content) => Ok(Some(content.decode_as::<OctetString>()?.as_bytes().to_vec())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_info_is_valid_der() {
        let digest = DigestAlgorithm::Sha256.digest(b"test");
        let der = digest_info(DigestAlgorithm::Sha256, &digest).unwrap();
        let decoded = DigestInfo::from_der(&der).unwrap();
        assert_eq!(decoded.algorithm.oid, DigestAlgorithm::Sha256.oid());
        assert_eq!(decoded.digest.as_bytes(), digest.as_slice());
    }

    #[test]
    fn digest_info_matches_the_pkcs1_prefix() {
        // RFC 8017 appendix B.1: the bytes a PKCS#1 v1.5 verifier expects
        // inside the padding for SHA-256.
        const SHA256_PREFIX: [u8; 19] = [
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65,
            0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
        ];
        let digest = DigestAlgorithm::Sha256.digest(b"test");
        let der = digest_info(DigestAlgorithm::Sha256, &digest).unwrap();
        let mut expected = SHA256_PREFIX.to_vec();
        expected.extend_from_slice(&digest);
        assert_eq!(der, expected);
    }

    #[test]
    fn arbitrary_bytes_are_not_signed_data() {
        assert!(!is_signed_data(b"%PDF-1.4 not cms"));
        assert!(!is_signed_data(&[]));
        assert!(encapsulated_content(b"junk").is_err());
    }
}
