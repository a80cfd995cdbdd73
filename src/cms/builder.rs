//! SignedData assembly with CAdES signed attributes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use der::asn1::{OctetString, SetOfVec, UtcTime};
use der::{Any, Decode, Encode, Sequence};
use log::debug;
use sha2::{Digest, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::{Attribute, AttributeValue};
use x509_cert::Certificate;

use super::{
    any_from, decode_signed_data, digest_info, OID_CONTENT_TYPE, OID_DATA, OID_MESSAGE_DIGEST,
    OID_RSA_ENCRYPTION, OID_SIGNED_DATA, OID_SIGNING_CERTIFICATE_V2, OID_SIGNING_TIME,
};
use crate::error::{Error, Result};
use crate::types::DigestAlgorithm;

/// ESSCertIDv2 with the hash algorithm spelled out even though SHA-256 is
/// the schema default; verifiers in the wild expect it explicit.
#[derive(Debug, Sequence)]
struct EssCertIdV2 {
    hash_algorithm: AlgorithmIdentifierOwned,
    cert_hash: OctetString,
}

/// signingCertificateV2 attribute value, policies omitted.
#[derive(Debug, Sequence)]
struct SigningCertificateV2 {
    certs: Vec<EssCertIdV2>,
}

/// Signed attributes plus the DigestInfo ready for the token.
///
/// The attributes are fully determined by content, certificate and signing
/// time, so preparing twice with the same inputs yields identical bytes.
/// The two-pass PDF flow depends on that.
pub struct PreparedSignature {
    signed_attrs: SignedAttributes,
    digest_info: Vec<u8>,
}

impl PreparedSignature {
    /// DER DigestInfo to hand to the token's raw RSA mechanism.
    pub fn digest_info(&self) -> &[u8] {
        &self.digest_info
    }

    /// DER of the signed attributes as they will be digested and signed.
    pub fn signed_attrs_der(&self) -> Result<Vec<u8>> {
        Ok(self.signed_attrs.to_der()?)
    }
}

/// Builds and extends CMS SignedData containers.
#[derive(Debug, Clone, Copy)]
pub struct CmsBuilder {
    algorithm: DigestAlgorithm,
}

impl CmsBuilder {
    /// Builder using `algorithm` for the whole digest chain.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Compute the signed attributes and the DigestInfo for `content`.
    ///
    /// `signing_time` is optional: when absent, no signing-time attribute is
    /// emitted at all and verifiers fall back to other time sources.
    pub fn prepare(
        &self,
        content: &[u8],
        cert_der: &[u8],
        signing_time: Option<DateTime<Utc>>,
    ) -> Result<PreparedSignature> {
        let content_digest = self.algorithm.digest(content);
        let signed_attrs = self.signed_attributes(&content_digest, cert_der, signing_time)?;
        let attrs_digest = self.algorithm.digest(&signed_attrs.to_der()?);
        let digest_info = digest_info(self.algorithm, &attrs_digest)?;
        Ok(PreparedSignature { signed_attrs, digest_info })
    }

    /// Build a fresh SignedData around `content`.
    ///
    /// `detached` leaves the content out of the container (the p7s/CAdES
    /// shape embedded in PDFs); otherwise the container envelops it. The
    /// `sign_fn` seam receives the DigestInfo and returns the raw RSA
    /// signature from the token.
    pub fn sign(
        &self,
        content: &[u8],
        cert_der: &[u8],
        signing_time: Option<DateTime<Utc>>,
        detached: bool,
        sign_fn: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let prepared = self.prepare(content, cert_der, signing_time)?;
        let signature = sign_fn(prepared.digest_info())?;
        let cert = parse_cert(cert_der)?;
        let signer_info = self.signer_info(&cert, prepared.signed_attrs, signature)?;

        let mut digest_algorithms = SetOfVec::new();
        digest_algorithms.insert(self.digest_alg_id())?;
        let mut certificates = SetOfVec::new();
        certificates.insert(CertificateChoices::Certificate(cert))?;
        let mut signer_infos = SetOfVec::new();
        signer_infos.insert(signer_info)?;

        let econtent = if detached {
            None
        } else {
            Some(any_from(&OctetString::new(content)?)?)
        };
        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: OID_DATA,
                econtent,
            },
            certificates: Some(CertificateSet(certificates)),
            crls: None,
            signer_infos: SignerInfos(signer_infos),
        };
        encode_content_info(&signed_data)
    }

    /// Append a new signer to an existing container.
    ///
    /// Prior SignerInfos, certificates and CRLs are carried forward without
    /// re-encoding their semantics; only the new SignerInfo, the signer
    /// certificate and the digest algorithm set are touched. Detached
    /// containers need the original content supplied in `external_content`.
    pub fn resign(
        &self,
        existing: &[u8],
        external_content: Option<&[u8]>,
        cert_der: &[u8],
        signing_time: Option<DateTime<Utc>>,
        sign_fn: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut signed_data = decode_signed_data(existing)?;
        let content = match (&signed_data.encap_content_info.econtent, external_content) {
            (Some(embedded), _) => embedded.decode_as::<OctetString>()?.as_bytes().to_vec(),
            (None, Some(external)) => external.to_vec(),
            (None, None) => {
                return Err(Error::CmsEncoding(
                    "cannot resign a detached container without its content".to_string(),
                ))
            }
        };
        debug!(
            "resigning container with {} existing signer(s)",
            signed_data.signer_infos.0.len()
        );

        let prepared = self.prepare(&content, cert_der, signing_time)?;
        let signature = sign_fn(prepared.digest_info())?;
        let cert = parse_cert(cert_der)?;
        let signer_info = self.signer_info(&cert, prepared.signed_attrs, signature)?;
        signed_data.signer_infos.0.insert(signer_info)?;

        let alg_id = self.digest_alg_id();
        if !signed_data.digest_algorithms.iter().any(|a| a.oid == alg_id.oid) {
            signed_data.digest_algorithms.insert(alg_id)?;
        }

        let choice = CertificateChoices::Certificate(cert);
        match signed_data.certificates.as_mut() {
            Some(set) => {
                if !set.0.iter().any(|c| c == &choice) {
                    set.0.insert(choice)?;
                }
            }
            None => {
                let mut set = SetOfVec::new();
                set.insert(choice)?;
                signed_data.certificates = Some(CertificateSet(set));
            }
        }
        encode_content_info(&signed_data)
    }

    fn digest_alg_id(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned { oid: self.algorithm.oid(), parameters: None }
    }

    fn signed_attributes(
        &self,
        content_digest: &[u8],
        cert_der: &[u8],
        signing_time: Option<DateTime<Utc>>,
    ) -> Result<SignedAttributes> {
        let mut attrs = SetOfVec::new();
        attrs.insert(attribute(OID_CONTENT_TYPE, any_from(&OID_DATA)?)?)?;
        if let Some(time) = signing_time {
            attrs.insert(attribute(OID_SIGNING_TIME, any_from(&utc_time(time)?)?)?)?;
        }
        attrs.insert(attribute(
            OID_MESSAGE_DIGEST,
            any_from(&OctetString::new(content_digest)?)?,
        )?)?;

        // The certificate binding hash is always SHA-256, independent of the
        // digest algorithm used for the content chain.
        let ess = SigningCertificateV2 {
            certs: vec![EssCertIdV2 {
                hash_algorithm: AlgorithmIdentifierOwned {
                    oid: DigestAlgorithm::Sha256.oid(),
                    parameters: None,
                },
                cert_hash: OctetString::new(Sha256::digest(cert_der).to_vec())?,
            }],
        };
        attrs.insert(attribute(OID_SIGNING_CERTIFICATE_V2, any_from(&ess)?)?)?;
        Ok(attrs)
    }

    fn signer_info(
        &self,
        cert: &Certificate,
        signed_attrs: SignedAttributes,
        signature: Vec<u8>,
    ) -> Result<SignerInfo> {
        Ok(SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: self.digest_alg_id(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: OID_RSA_ENCRYPTION,
                parameters: None,
            },
            signature: OctetString::new(signature)?,
            unsigned_attrs: None,
        })
    }
}

fn parse_cert(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der)
        .map_err(|e| Error::CmsEncoding(format!("signer certificate does not parse: {}", e)))
}

fn encode_content_info(signed_data: &SignedData) -> Result<Vec<u8>> {
    let ci = ContentInfo {
        content_type: OID_SIGNED_DATA,
        content: any_from(signed_data)?,
    };
    Ok(ci.to_der()?)
}

fn attribute(oid: der::asn1::ObjectIdentifier, value: Any) -> Result<Attribute> {
    let mut values: SetOfVec<AttributeValue> = SetOfVec::new();
    values.insert(value)?;
    Ok(Attribute { oid, values })
}

fn utc_time(time: DateTime<Utc>) -> Result<UtcTime> {
    let secs = u64::try_from(time.timestamp())
        .map_err(|_| Error::CmsEncoding("signing time precedes the epoch".to_string()))?;
    UtcTime::from_unix_duration(Duration::from_secs(secs))
        .map_err(|e| Error::CmsEncoding(format!("signing time not representable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn has_attr(prepared: &PreparedSignature, oid: der::asn1::ObjectIdentifier) -> bool {
        prepared.signed_attrs.iter().any(|a| a.oid == oid)
    }

    #[test]
    fn prepare_is_deterministic() {
        let builder = CmsBuilder::new(DigestAlgorithm::Sha256);
        let time = Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap();
        let a = builder.prepare(b"content", b"CERT", Some(time)).unwrap();
        let b = builder.prepare(b"content", b"CERT", Some(time)).unwrap();
        assert_eq!(a.signed_attrs_der().unwrap(), b.signed_attrs_der().unwrap());
        assert_eq!(a.digest_info(), b.digest_info());
    }

    #[test]
    fn signing_time_attribute_only_when_supplied() {
        let builder = CmsBuilder::new(DigestAlgorithm::Sha256);
        let with = builder
            .prepare(b"x", b"CERT", Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let without = builder.prepare(b"x", b"CERT", None).unwrap();
        assert!(has_attr(&with, OID_SIGNING_TIME));
        assert!(!has_attr(&without, OID_SIGNING_TIME));
    }

    #[test]
    fn mandatory_attributes_are_present() {
        let builder = CmsBuilder::new(DigestAlgorithm::Sha256);
        let prepared = builder.prepare(b"payload", b"CERT", None).unwrap();
        assert!(has_attr(&prepared, OID_CONTENT_TYPE));
        assert!(has_attr(&prepared, OID_MESSAGE_DIGEST));
        assert!(has_attr(&prepared, OID_SIGNING_CERTIFICATE_V2));
    }

    #[test]
    fn message_digest_matches_content() {
        let builder = CmsBuilder::new(DigestAlgorithm::Sha256);
        let prepared = builder.prepare(b"payload", b"CERT", None).unwrap();
        let expected = DigestAlgorithm::Sha256.digest(b"payload");
        let attr = prepared
            .signed_attrs
            .iter()
            .find(|a| a.oid == OID_MESSAGE_DIGEST)
            .unwrap();
        let value = attr.values.iter().next().unwrap();
        let digest: OctetString = value.decode_as().unwrap();
        assert_eq!(digest.as_bytes(), expected.as_slice());
    }
}
