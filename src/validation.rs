//! Certificate inspection and advisory validation.
//!
//! Checks here are advisory: an expired, self-signed or revoked certificate
//! is surfaced to the caller as a warning, not a hard failure. When no CRL
//! can be obtained the revocation status is `Unknown` and signing proceeds.

use chrono::{DateTime, Utc};
use log::warn;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Sha256, Sha384, Sha512};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::types::DigestAlgorithm;

/// Outcome of a best-effort revocation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    /// The certificate does not appear in any fetched CRL.
    Good,
    /// The certificate serial appears in a fetched CRL.
    Revoked,
    /// No CRL could be fetched or parsed; treated as non-blocking.
    Unknown,
}

/// Fetches DER-encoded CRLs for distribution point URLs.
///
/// The network transport lives outside the core; callers plug in whatever
/// fetcher fits their environment. Without one, revocation is `Unknown`.
pub trait CrlFetcher {
    /// Fetch the CRL published at `url`, returning its DER bytes.
    fn fetch(&self, url: &str) -> Option<Vec<u8>>;
}

/// A non-fatal finding about a signer certificate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateAdvisory {
    /// The certificate is outside its validity window.
    #[error("the certificate is currently expired")]
    Expired,
    /// The certificate is self-signed.
    #[error("the certificate is self signed")]
    SelfSigned,
    /// The certificate is not valid for non-repudiation.
    #[error("the certificate is not valid for 'Non Repudiation'")]
    NotNonRepudiation,
    /// The certificate appears in a CRL.
    #[error("the certificate has been revoked")]
    Revoked,
    /// No CRL could be obtained; revocation state unknown.
    #[error("the certificate revocation state could not be determined")]
    RevocationUnknown,
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CmsEncoding(format!("invalid X.509 certificate: {}", e)))?;
    Ok(cert)
}

/// Subject common name, empty when absent.
pub fn subject_common_name(der: &[u8]) -> String {
    parse(der)
        .ok()
        .and_then(|cert| {
            cert.subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok().map(|s| s.to_string()))
        })
        .unwrap_or_default()
}

/// Subject organization, or `None` when absent.
pub fn subject_organization(der: &[u8]) -> Option<String> {
    parse(der).ok().and_then(|cert| {
        cert.subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok().map(|s| s.to_string()))
    })
}

/// Full subject distinguished name for error messages.
pub fn subject_name(der: &[u8]) -> String {
    parse(der).map(|cert| cert.subject().to_string()).unwrap_or_default()
}

fn key_usage_bit(der: &[u8], pick: impl Fn(&KeyUsage) -> bool) -> bool {
    let Ok(cert) = parse(der) else { return false };
    match cert.key_usage() {
        Ok(Some(ku)) => pick(ku.value),
        _ => false,
    }
}

/// Key usage includes digitalSignature.
pub fn is_for_signing(der: &[u8]) -> bool {
    key_usage_bit(der, |ku| ku.digital_signature())
}

/// Key usage includes nonRepudiation (content commitment).
pub fn is_non_repudiation(der: &[u8]) -> bool {
    key_usage_bit(der, |ku| ku.non_repudiation())
}

/// Certificate qualifies for the catalog: digitalSignature or nonRepudiation.
pub fn has_signing_usage(der: &[u8]) -> bool {
    key_usage_bit(der, |ku| ku.digital_signature() || ku.non_repudiation())
}

/// The certificate is outside its validity window at `at`.
pub fn is_expired(der: &[u8], at: DateTime<Utc>) -> bool {
    match parse(der) {
        Ok(cert) => {
            let t = at.timestamp();
            t < cert.validity().not_before.timestamp() || t > cert.validity().not_after.timestamp()
        }
        Err(_) => true,
    }
}

/// RSA public key extracted from the certificate's SubjectPublicKeyInfo.
pub fn rsa_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    let cert = parse(der)?;
    RsaPublicKey::from_public_key_der(cert.tbs_certificate.subject_pki.raw)
        .map_err(|e| Error::CmsEncoding(format!("unsupported public key: {}", e)))
}

/// Verify an RSA PKCS#1 v1.5 signature over `message` with the certificate's
/// public key. Returns false for non-RSA keys or any verification failure.
pub fn verify_rsa_pkcs1v15(
    cert_der: &[u8],
    algorithm: DigestAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(key) = rsa_public_key(cert_der) else { return false };
    let hashed = algorithm.digest(message);
    let scheme = match algorithm {
        DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
        DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    };
    key.verify(scheme, &hashed, signature).is_ok()
}

/// The certificate verifies under its own public key (issuer == signer).
pub fn is_self_signed(der: &[u8]) -> bool {
    let Ok(cert) = parse(der) else { return false };
    if cert.subject() != cert.issuer() {
        return false;
    }
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    let algorithm = match oid.as_str() {
        "1.2.840.113549.1.1.11" => DigestAlgorithm::Sha256,
        "1.2.840.113549.1.1.12" => DigestAlgorithm::Sha384,
        "1.2.840.113549.1.1.13" => DigestAlgorithm::Sha512,
        _ => return false,
    };
    verify_rsa_pkcs1v15(
        der,
        algorithm,
        cert.tbs_certificate.as_ref(),
        &cert.signature_value.data,
    )
}

/// Extract every HTTP(S)/LDAP URL from the CRLDistributionPoints extension.
pub fn crl_distribution_urls(der: &[u8]) -> Vec<String> {
    let mut urls = Vec::new();
    let Ok(cert) = parse(der) else { return urls };
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            urls.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }
    urls
}

/// Best-effort revocation check against the certificate's CRL distribution
/// points. HTTP URLs are tried before LDAP ones, matching the original
/// retrieval order; the first CRL that parses decides.
pub fn revocation_status(der: &[u8], fetcher: Option<&dyn CrlFetcher>) -> RevocationStatus {
    let Some(fetcher) = fetcher else { return RevocationStatus::Unknown };
    let Ok(cert) = parse(der) else { return RevocationStatus::Unknown };

    let urls = crl_distribution_urls(der);
    if urls.is_empty() {
        return RevocationStatus::Unknown;
    }
    let (ldap, http): (Vec<_>, Vec<_>) =
        urls.into_iter().partition(|u| u.to_ascii_lowercase().starts_with("ldap"));

    for url in http.iter().chain(ldap.iter()) {
        let Some(crl_der) = fetcher.fetch(url) else {
            warn!("CRL fetch failed for {}", url);
            continue;
        };
        match CertificateRevocationList::from_der(&crl_der) {
            Ok((_, crl)) => {
                let revoked = crl
                    .iter_revoked_certificates()
                    .any(|rc| rc.user_certificate == cert.serial);
                return if revoked { RevocationStatus::Revoked } else { RevocationStatus::Good };
            }
            Err(e) => warn!("CRL from {} did not parse: {}", url, e),
        }
    }
    RevocationStatus::Unknown
}

/// Run every advisory check on a signer certificate.
///
/// Mirrors the policy applied to full-container verification: self-signed,
/// non-repudiation usage, validity window, and best-effort revocation.
pub fn check_certificate(
    der: &[u8],
    at: DateTime<Utc>,
    fetcher: Option<&dyn CrlFetcher>,
) -> Vec<CertificateAdvisory> {
    let mut advisories = Vec::new();
    if is_self_signed(der) {
        advisories.push(CertificateAdvisory::SelfSigned);
    }
    if !is_non_repudiation(der) {
        advisories.push(CertificateAdvisory::NotNonRepudiation);
    }
    if is_expired(der, at) {
        advisories.push(CertificateAdvisory::Expired);
    }
    match revocation_status(der, fetcher) {
        RevocationStatus::Revoked => advisories.push(CertificateAdvisory::Revoked),
        RevocationStatus::Unknown => advisories.push(CertificateAdvisory::RevocationUnknown),
        RevocationStatus::Good => {}
    }
    advisories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_certificate_is_handled() {
        let junk = b"not a certificate";
        assert!(!is_for_signing(junk));
        assert!(!is_non_repudiation(junk));
        assert!(!is_self_signed(junk));
        assert!(is_expired(junk, Utc::now()));
        assert_eq!(subject_common_name(junk), "");
        assert!(crl_distribution_urls(junk).is_empty());
    }

    #[test]
    fn revocation_without_fetcher_is_unknown() {
        assert_eq!(revocation_status(b"junk", None), RevocationStatus::Unknown);
    }

    #[test]
    fn advisory_messages() {
        assert!(CertificateAdvisory::Expired.to_string().contains("expired"));
        assert!(CertificateAdvisory::Revoked.to_string().contains("revoked"));
    }
}
