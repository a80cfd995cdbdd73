//! Verification of SignedData containers.
//!
//! Used by the PDF self-check and the test suite. Every SignerInfo in the
//! container must verify; a single bad signer fails the whole container.

use chrono::Utc;
use cms::cert::CertificateChoices;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::OctetString;
use der::Encode;
use log::{debug, warn};
use x509_cert::Certificate;

use super::{decode_signed_data, OID_MESSAGE_DIGEST};
use crate::error::{Error, Result};
use crate::types::DigestAlgorithm;
use crate::validation;

/// Verify a detached container against the externally supplied content.
/// Returns the number of signers checked.
pub fn verify_detached(cms_der: &[u8], content: &[u8]) -> Result<usize> {
    let signed_data = decode_signed_data(cms_der)?;
    verify_signers(&signed_data, content)
}

/// Verify an enveloping container and hand back its content.
pub fn verify_enveloping(cms_der: &[u8]) -> Result<Vec<u8>> {
    let signed_data = decode_signed_data(cms_der)?;
    let content = signed_data
        .encap_content_info
        .econtent
        .as_ref()
        .ok_or_else(|| Error::CmsEncoding("container has no encapsulated content".to_string()))?
        .decode_as::<OctetString>()?
        .as_bytes()
        .to_vec();
    verify_signers(&signed_data, &content)?;
    Ok(content)
}

fn verify_signers(signed_data: &SignedData, content: &[u8]) -> Result<usize> {
    let mut checked = 0;
    for (index, signer) in signed_data.signer_infos.0.iter().enumerate() {
        verify_one(signed_data, signer, content)
            .map_err(|e| Error::Verification(format!("signer {}: {}", index, e)))?;
        checked += 1;
    }
    if checked == 0 {
        return Err(Error::Verification("container has no signers".to_string()));
    }
    debug!("verified {} signer(s)", checked);
    Ok(checked)
}

fn verify_one(signed_data: &SignedData, signer: &SignerInfo, content: &[u8]) -> Result<()> {
    let algorithm = DigestAlgorithm::from_oid(&signer.digest_alg.oid)
        .ok_or_else(|| Error::CmsEncoding(format!("digest {} unsupported", signer.digest_alg.oid)))?;

    let attrs = signer
        .signed_attrs
        .as_ref()
        .ok_or_else(|| Error::CmsEncoding("signer has no signed attributes".to_string()))?;

    // The message-digest attribute must commit to the actual content.
    let expected = algorithm.digest(content);
    let committed: OctetString = attrs
        .iter()
        .find(|a| a.oid == OID_MESSAGE_DIGEST)
        .and_then(|a| a.values.iter().next())
        .ok_or_else(|| Error::CmsEncoding("message-digest attribute missing".to_string()))?
        .decode_as()?;
    if committed.as_bytes() != expected.as_slice() {
        return Err(Error::Verification(
            "message-digest does not match the content".to_string(),
        ));
    }

    let cert = find_signer_certificate(signed_data, &signer.sid)?;
    let cert_der = cert.to_der()?;
    let attrs_der = attrs.to_der()?;
    if !validation::verify_rsa_pkcs1v15(
        &cert_der,
        algorithm,
        &attrs_der,
        signer.signature.as_bytes(),
    ) {
        return Err(Error::Verification(
            "RSA signature over the signed attributes is invalid".to_string(),
        ));
    }
    // Certificate findings are advisory and never fail the container.
    for advisory in validation::check_certificate(&cert_der, Utc::now(), None) {
        warn!("signer certificate advisory: {}", advisory);
    }
    Ok(())
}

fn find_signer_certificate<'a>(
    signed_data: &'a SignedData,
    sid: &SignerIdentifier,
) -> Result<&'a Certificate> {
    let SignerIdentifier::IssuerAndSerialNumber(wanted) = sid else {
        return Err(Error::CmsEncoding(
            "subjectKeyIdentifier signer identification is not supported".to_string(),
        ));
    };
    signed_data
        .certificates
        .as_ref()
        .and_then(|set| {
            set.0.iter().find_map(|choice| match choice {
                CertificateChoices::Certificate(cert)
                    if cert.tbs_certificate.issuer == wanted.issuer
                        && cert.tbs_certificate.serial_number == wanted.serial_number =>
                {
                    Some(cert)
                }
                _ => None,
            })
        })
        .ok_or_else(|| {
            Error::CmsEncoding("signer certificate is not present in the container".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn junk_is_rejected() {
        assert!(verify_detached(b"junk", b"content").is_err());
        assert!(verify_enveloping(b"junk").is_err());
    }
}
