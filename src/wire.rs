//! JSON wire contract.
//!
//! The transport (websocket, pipe, HTTP) lives outside this crate; these
//! types pin down the camelCase JSON shape exchanged with front ends.
//! Document content travels base64 encoded in both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::catalog::CertificateCatalog;
use crate::error::{Error, Result};
use crate::types::{SignConfig, SignPosition, SignableDocument, SignedResult};
use crate::validation;

fn default_true() -> bool {
    true
}

fn default_last_page() -> i32 {
    -1
}

/// A signing request as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequestWire {
    /// Documents to sign.
    #[serde(default)]
    pub data_to_sign: Vec<DocumentWire>,
    /// Candidate PKCS#11 module paths, in probing order.
    #[serde(default)]
    pub module_paths: Vec<String>,
    /// Display id of the certificate to sign with.
    #[serde(default)]
    pub certificate_id: String,
    /// Token PIN, empty for protected authentication path.
    #[serde(default)]
    pub pin: String,
    /// Catalog every certificate, not only signing-capable ones.
    #[serde(default)]
    pub read_all_certs: bool,
}

/// One document in a wire request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentWire {
    /// Caller-chosen identifier, echoed back.
    pub id: String,
    /// Base64 of the raw content.
    pub content_bytes: String,
    /// Per-document signing options.
    #[serde(default)]
    pub params: SignParamsWire,
}

/// Per-document options as they travel on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignParamsWire {
    /// Force an enveloping PKCS#7 even for PDFs.
    #[serde(default)]
    pub sign_pdf_as_p7m: bool,
    /// Draw a signature widget.
    #[serde(default = "default_true")]
    pub visible_signature: bool,
    /// 1-based page to sign, non-positive for the last page.
    #[serde(default = "default_last_page")]
    pub page_num_to_sign: i32,
    /// `""`, `"left"` or `"right"`.
    #[serde(default)]
    pub sign_position: String,
}

impl Default for SignParamsWire {
    fn default() -> Self {
        Self {
            sign_pdf_as_p7m: false,
            visible_signature: true,
            page_num_to_sign: -1,
            sign_position: String::new(),
        }
    }
}

impl DocumentWire {
    /// Decode into the internal document type.
    pub fn into_document(self) -> Result<SignableDocument> {
        let content = BASE64.decode(self.content_bytes.as_bytes()).map_err(|e| {
            Error::Config(format!("document '{}' is not valid base64: {}", self.id, e))
        })?;
        let config = SignConfig {
            sign_pdf_as_p7m: self.params.sign_pdf_as_p7m,
            visible_signature: self.params.visible_signature,
            page_num_to_sign: self.params.page_num_to_sign,
            sign_position: SignPosition::parse(&self.params.sign_position)?,
        };
        SignableDocument::new(self.id, content, config)
    }
}

/// A catalog entry as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateWire {
    /// Display id, used to pick the certificate in a later request.
    pub id: String,
    /// Subject common name.
    pub common_name: String,
    /// Subject organization, when present.
    pub organization: Option<String>,
    /// The certificate is currently outside its validity window.
    pub expired: bool,
    /// Base64 of the DER certificate.
    pub certificate: String,
}

/// Render a catalog for clients.
pub fn catalog_to_wire(catalog: &CertificateCatalog) -> Vec<CertificateWire> {
    let now = Utc::now();
    catalog
        .entries()
        .iter()
        .map(|entry| CertificateWire {
            id: entry.display_id.clone(),
            common_name: validation::subject_common_name(&entry.der),
            organization: validation::subject_organization(&entry.der),
            expired: validation::is_expired(&entry.der, now),
            certificate: BASE64.encode(&entry.der),
        })
        .collect()
}

/// One signed document in a wire response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDocumentWire {
    /// Identifier from the request.
    pub id: String,
    /// Base64 of the signed bytes.
    pub content_bytes: String,
}

/// Outcome of a signing run: signed documents, or one error for the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponseWire {
    /// Signed documents; absent when the batch failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_signed: Option<Vec<SignedDocumentWire>>,
    /// Failure description; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignResponseWire {
    /// Successful response carrying the signed documents.
    pub fn success(results: &[SignedResult]) -> Self {
        Self {
            data_signed: Some(
                results
                    .iter()
                    .map(|r| SignedDocumentWire {
                        id: r.id.clone(),
                        content_bytes: BASE64.encode(&r.content),
                    })
                    .collect(),
            ),
            error: None,
        }
    }

    /// Error response; the whole batch produced nothing.
    pub fn failure(error: &Error) -> Self {
        Self { data_signed: None, error: Some(error.to_string()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputFormat;

    #[test]
    fn request_fields_are_camel_case() {
        let json = r#"{
            "modulePaths": ["/usr/lib/opensc-pkcs11.so"],
            "certificateId": "0: Mario Rossi    Org:ACME",
            "pin": "1234",
            "dataToSign": [
                {"id": "d1", "contentBytes": "aGVsbG8=", "params": {"signPdfAsP7m": true}}
            ]
        }"#;
        let req: SignRequestWire = serde_json::from_str(json).unwrap();
        assert_eq!(req.module_paths.len(), 1);
        assert!(!req.read_all_certs);
        let doc = req.data_to_sign[0].clone().into_document().unwrap();
        assert_eq!(doc.content, b"hello");
        assert!(doc.config.sign_pdf_as_p7m);
        assert!(doc.config.visible_signature);
        assert_eq!(doc.config.page_num_to_sign, -1);
    }

    #[test]
    fn omitted_params_take_defaults() {
        let json = r#"{"dataToSign": [{"id": "d1", "contentBytes": "aGVsbG8="}]}"#;
        let req: SignRequestWire = serde_json::from_str(json).unwrap();
        let doc = req.data_to_sign[0].clone().into_document().unwrap();
        assert!(!doc.config.sign_pdf_as_p7m);
        assert!(doc.config.visible_signature);
        assert_eq!(doc.config.page_num_to_sign, -1);
        assert_eq!(doc.config.sign_position, SignPosition::Auto);
    }

    #[test]
    fn bad_base64_is_a_config_error() {
        let doc = DocumentWire {
            id: "d1".to_string(),
            content_bytes: "not base64!!!".to_string(),
            params: SignParamsWire::default(),
        };
        assert!(matches!(doc.into_document(), Err(Error::Config(_))));
    }

    #[test]
    fn response_serializes_camel_case() {
        let results = vec![SignedResult {
            id: "d1".to_string(),
            content: b"signed".to_vec(),
            format: OutputFormat::Pdf,
        }];
        let json = serde_json::to_string(&SignResponseWire::success(&results)).unwrap();
        assert!(json.contains("\"dataSigned\""));
        assert!(json.contains("\"contentBytes\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn failure_response_carries_message() {
        let err = Error::Config("boom".to_string());
        let resp = SignResponseWire::failure(&err);
        assert!(resp.data_signed.is_none());
        assert!(resp.error.unwrap().contains("boom"));
    }
}
