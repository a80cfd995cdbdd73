//! Shared fixtures: self-signed RSA identities, soft tokens and tiny PDFs.

use std::str::FromStr;
use std::time::Duration;

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use smartsign::token::soft::{SoftKey, SoftToken};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::{Decode, Encode};
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

/// A key pair with a matching self-signed certificate.
pub struct TestIdentity {
    pub private_key: RsaPrivateKey,
    pub cert_der: Vec<u8>,
}

/// Build a self-signed identity with the given subject and key usages.
pub fn identity(cn: &str, org: Option<&str>, usages: KeyUsages) -> TestIdentity {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());

    let subject = match org {
        Some(org) => Name::from_str(&format!("CN={},O={}", cn, org)).expect("subject"),
        None => Name::from_str(&format!("CN={}", cn)).expect("subject"),
    };
    let spki_der = private_key
        .to_public_key()
        .to_public_key_der()
        .expect("spki");
    let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).expect("spki der");

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer: None },
        SerialNumber::from(rand::random::<u32>() | 1),
        Validity::from_now(Duration::from_secs(365 * 24 * 3600)).expect("validity"),
        subject,
        spki,
        &signing_key,
    )
    .expect("builder");
    builder
        .add_extension(&KeyUsage(usages.into()))
        .expect("key usage");
    let cert = builder.build::<rsa::pkcs1v15::Signature>().expect("build cert");
    TestIdentity { private_key, cert_der: cert.to_der().expect("cert der") }
}

/// Soft token with one slot holding the given identities.
pub fn token_with(identities: &[(&TestIdentity, &[u8], &str)]) -> SoftToken {
    let mut token = SoftToken::new();
    token.add_slot(0, false, false, "");
    for (identity, key_id, label) in identities {
        token.add_key(
            0,
            SoftKey {
                id: key_id.to_vec(),
                label: label.to_string(),
                cert_der: identity.cert_der.clone(),
                private_key: identity.private_key.clone(),
                sign_capable: true,
            },
        );
    }
    token
}

/// A valid single-revision PDF with `pages` empty pages.
pub fn minimal_pdf(pages: usize) -> Vec<u8> {
    assert!(pages >= 1);
    let mut out: Vec<u8> = Vec::new();
    let mut offsets: Vec<usize> = Vec::new();

    out.extend_from_slice(b"%PDF-1.4\n");
    let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", 3 + i)).collect();

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "2 0 obj\n<< /Type /Pages /Kids [{}] /Count {} /MediaBox [0 0 595 842] >>\nendobj\n",
            kids.join(" "),
            pages,
        )
        .as_bytes(),
    );
    for i in 0..pages {
        offsets.push(out.len());
        out.extend_from_slice(
            format!("{} 0 obj\n<< /Type /Page /Parent 2 0 R >>\nendobj\n", 3 + i).as_bytes(),
        );
    }

    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            offsets.len() + 1,
            xref_at,
        )
        .as_bytes(),
    );
    out
}
