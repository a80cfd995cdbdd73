//! Incremental CAdES PDF signing.
//!
//! Signing never rewrites existing bytes: a new revision is appended after
//! the last %%EOF with the signature field, its widget, the updated page and
//! catalog, and a classic cross-reference section chaining back to the
//! previous one via /Prev.
//!
//! The update is built twice. The first pass reserves a default-sized
//! /Contents area and produces a real CMS over its byte range only to learn
//! the exact container size; the second pass rebuilds the revision with a
//! placeholder of precisely that size and signs the final byte range. The
//! embedded hex is zero padded on the right up to the reserved width.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::document::PdfDocument;
use super::object::{Object, ObjectRef};
use super::placement::{widget_rect, Rect};
use crate::cms::{verify_detached, CmsBuilder};
use crate::error::{Error, Result};
use crate::types::{DigestAlgorithm, SignConfig};
use crate::validation;

/// Reserved /Contents size for the measuring pass, in bytes.
const DEFAULT_PLACEHOLDER: usize = 4000;

/// Result of the post-signing verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfCheckReport {
    /// Signatures found and cryptographically verified.
    pub signatures: usize,
    /// At least one signature covers the file from start to end.
    pub whole_file_covered: bool,
}

/// Signs PDFs by appending an incremental update with an embedded CAdES
/// detached container.
#[derive(Debug, Clone, Copy)]
pub struct PdfSigner {
    algorithm: DigestAlgorithm,
}

struct Increment {
    bytes: Vec<u8>,
    contents_start: usize,
    contents_end: usize,
}

impl Increment {
    /// Everything the signature covers: the file minus the hex placeholder.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(&self.bytes[..self.contents_start]);
        out.extend_from_slice(&self.bytes[self.contents_end..]);
        out
    }
}

impl PdfSigner {
    /// Signer using `algorithm` for the CMS digest chain.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Append a signed revision to `pdf`.
    ///
    /// `signing_time` is fixed by the caller so both passes emit identical
    /// signed attributes apart from the message digest. The produced file is
    /// re-parsed and every signature verified before it is returned.
    pub fn sign(
        &self,
        pdf: &[u8],
        cert_der: &[u8],
        config: &SignConfig,
        signing_time: DateTime<Utc>,
        sign_fn: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let builder = CmsBuilder::new(self.algorithm);

        let first = self.build_increment(pdf, cert_der, config, signing_time, DEFAULT_PLACEHOLDER)?;
        let probe_cms =
            builder.sign(&first.signed_bytes(), cert_der, Some(signing_time), true, sign_fn)?;
        debug!("measuring pass produced a {} byte container", probe_cms.len());

        let mut second =
            self.build_increment(pdf, cert_der, config, signing_time, probe_cms.len())?;
        let cms =
            builder.sign(&second.signed_bytes(), cert_der, Some(signing_time), true, sign_fn)?;
        embed_contents(&mut second, &cms)?;
        let out = second.bytes;

        let report = self.self_check(&out)?;
        if !report.whole_file_covered {
            return Err(Error::PdfStructure(
                "new signature does not cover the whole file".to_string(),
            ));
        }
        info!(
            "PDF signed, {} signature(s) verified in output",
            report.signatures
        );
        Ok(out)
    }

    /// Re-parse a signed file and verify every signature it contains.
    pub fn self_check(&self, pdf: &[u8]) -> Result<SelfCheckReport> {
        let doc = PdfDocument::parse(pdf)?;
        let sigs = doc.signature_dicts();
        if sigs.is_empty() {
            return Err(Error::PdfStructure("no signature dictionaries found".to_string()));
        }
        let mut whole_file_covered = false;
        for sig in &sigs {
            let signed = extract_ranges(pdf, &sig.byte_range)?;
            let der = trim_der(&sig.contents)?;
            verify_detached(der, &signed)?;
            let coverage = sig.byte_range[2] + sig.byte_range[3];
            if sig.byte_range[0] == 0 && coverage == pdf.len() as i64 {
                whole_file_covered = true;
            }
        }
        Ok(SelfCheckReport { signatures: sigs.len(), whole_file_covered })
    }

    fn build_increment(
        &self,
        pdf: &[u8],
        cert_der: &[u8],
        config: &SignConfig,
        signing_time: DateTime<Utc>,
        placeholder_bytes: usize,
    ) -> Result<Increment> {
        let doc = PdfDocument::parse(pdf)?;
        let catalog_ref = doc.catalog_ref()?;
        let page = doc.page_to_sign(config.page_num_to_sign)?;

        let rect = if config.visible_signature {
            let existing = doc.signature_widget_rects(page.reference);
            widget_rect(config.sign_position, &existing, page.media_box)
        } else {
            Rect::zero()
        };

        let base = doc.max_object_id();
        let sig_id = base + 1;
        let widget_id = base + 2;
        let (ap_id, font_id, next_free) = if config.visible_signature {
            (Some(base + 3), Some(base + 4), base + 5)
        } else {
            (None, None, base + 3)
        };

        let mut cn = validation::subject_common_name(cert_der);
        if cn.is_empty() {
            cn = "Unknown Signer".to_string();
        }

        let mut out = pdf.to_vec();
        if out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        let mut offsets: Vec<(u32, u16, usize)> = Vec::new();

        // Signature dictionary with fixed-width ByteRange and placeholder.
        offsets.push((sig_id, 0, out.len()));
        let header = format!(
            "{} 0 obj\n<< /Type /Sig /Filter /Adobe.PPKMS /SubFilter /ETSI.CAdES.detached \
             /Name {} /M (D:{}) /ByteRange ",
            sig_id,
            write_string(&cn),
            signing_time.format("%Y%m%d%H%M%S+00'00'"),
        );
        out.extend_from_slice(header.as_bytes());
        let byte_range_at = out.len();
        out.extend_from_slice(b"[0000000000 0000000000 0000000000 0000000000]");
        out.extend_from_slice(b" /Contents ");
        let contents_start = out.len();
        out.push(b'<');
        out.resize(out.len() + placeholder_bytes * 2, b'0');
        out.push(b'>');
        let contents_end = out.len();
        out.extend_from_slice(b" >>\nendobj\n");

        // Widget annotation doubling as the form field.
        offsets.push((widget_id, 0, out.len()));
        let mut widget = format!(
            "{} 0 obj\n<< /Type /Annot /Subtype /Widget /FT /Sig /T {} /V {} 0 R /F 132 \
             /P {} {} R /Rect [{} {} {} {}]",
            widget_id,
            write_string(&format!("Signature{}", sig_id)),
            sig_id,
            page.reference.id,
            page.reference.gen,
            fmt_coord(rect.llx),
            fmt_coord(rect.lly),
            fmt_coord(rect.urx),
            fmt_coord(rect.ury),
        );
        if let Some(ap) = ap_id {
            widget.push_str(&format!(" /AP << /N {} 0 R >>", ap));
        }
        widget.push_str(" >>\nendobj\n");
        out.extend_from_slice(widget.as_bytes());

        // Appearance form and font, only for visible signatures.
        if let (Some(ap), Some(font)) = (ap_id, font_id) {
            let stream = format!(
                "q BT /Helv 8 Tf 1 0 0 1 2 {} Tm {} Tj ET Q",
                fmt_coord(rect.height() / 2.0),
                write_string(&cn),
            );
            offsets.push((ap, 0, out.len()));
            out.extend_from_slice(
                format!(
                    "{} 0 obj\n<< /Type /XObject /Subtype /Form /FormType 1 /BBox [0 0 {} {}] \
                     /Resources << /Font << /Helv {} 0 R >> >> /Length {} >>\nstream\n{}\nendstream\nendobj\n",
                    ap,
                    fmt_coord(rect.width()),
                    fmt_coord(rect.height()),
                    font,
                    stream.len(),
                    stream,
                )
                .as_bytes(),
            );
            offsets.push((font, 0, out.len()));
            out.extend_from_slice(
                format!(
                    "{} 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica \
                     /Encoding /WinAnsiEncoding >>\nendobj\n",
                    font,
                )
                .as_bytes(),
            );
        }

        // Updated page carrying the new widget in /Annots.
        let page_dict = doc
            .get(page.reference.id)
            .and_then(|o| o.as_dict())
            .cloned()
            .ok_or_else(|| Error::PdfStructure("page object vanished".to_string()))?;
        let mut annots = doc.page_annots(page.reference);
        annots.push(Object::Reference(ObjectRef::new(widget_id, 0)));
        let mut page_dict = page_dict;
        page_dict.insert("Annots".to_string(), Object::Array(annots));
        offsets.push((page.reference.id, page.reference.gen, out.len()));
        out.extend_from_slice(
            format!(
                "{} {} obj\n{}\nendobj\n",
                page.reference.id,
                page.reference.gen,
                super::object::write_object(&Object::Dictionary(page_dict)),
            )
            .as_bytes(),
        );

        // Updated catalog with the AcroForm inlined.
        let mut catalog_dict = doc
            .get(catalog_ref.id)
            .and_then(|o| o.as_dict())
            .cloned()
            .ok_or_else(|| Error::PdfStructure("catalog object vanished".to_string()))?;
        let mut fields = doc.acroform_fields();
        fields.push(Object::Reference(ObjectRef::new(widget_id, 0)));
        let mut acroform = std::collections::HashMap::new();
        acroform.insert("Fields".to_string(), Object::Array(fields));
        acroform.insert("SigFlags".to_string(), Object::Integer(3));
        catalog_dict.insert("AcroForm".to_string(), Object::Dictionary(acroform));
        offsets.push((catalog_ref.id, doc.generation(catalog_ref.id), out.len()));
        out.extend_from_slice(
            format!(
                "{} {} obj\n{}\nendobj\n",
                catalog_ref.id,
                doc.generation(catalog_ref.id),
                super::object::write_object(&Object::Dictionary(catalog_dict)),
            )
            .as_bytes(),
        );

        // Cross-reference section and trailer.
        let xref_at = out.len();
        offsets.sort_unstable();
        out.extend_from_slice(b"xref\n");
        let mut i = 0;
        while i < offsets.len() {
            let run_start = i;
            while i + 1 < offsets.len() && offsets[i + 1].0 == offsets[i].0 + 1 {
                i += 1;
            }
            i += 1;
            let run = &offsets[run_start..i];
            out.extend_from_slice(format!("{} {}\n", run[0].0, run.len()).as_bytes());
            for (_, gen, offset) in run {
                out.extend_from_slice(format!("{:010} {:05} n \n", offset, gen).as_bytes());
            }
        }
        let mut trailer = format!(
            "trailer\n<< /Size {} /Root {} {} R",
            next_free, catalog_ref.id, catalog_ref.gen,
        );
        if let Some(prev) = doc.prev_startxref() {
            trailer.push_str(&format!(" /Prev {}", prev));
        }
        trailer.push_str(&format!(" >>\nstartxref\n{}\n%%EOF\n", xref_at));
        out.extend_from_slice(trailer.as_bytes());

        let total = out.len();
        patch_byte_range(&mut out, byte_range_at, contents_start, contents_end, total);
        Ok(Increment { bytes: out, contents_start, contents_end })
    }
}

fn patch_byte_range(
    bytes: &mut [u8],
    at: usize,
    contents_start: usize,
    contents_end: usize,
    total: usize,
) {
    let patched = format!(
        "[{:010} {:010} {:010} {:010}]",
        0,
        contents_start,
        contents_end,
        total - contents_end,
    );
    bytes[at..at + patched.len()].copy_from_slice(patched.as_bytes());
}

fn embed_contents(increment: &mut Increment, cms: &[u8]) -> Result<()> {
    let hex = bytes_to_hex(cms);
    let reserved = increment.contents_end - increment.contents_start - 2;
    if hex.len() > reserved {
        return Err(Error::PdfStructure(format!(
            "signature needs {} hex characters but only {} are reserved",
            hex.len(),
            reserved,
        )));
    }
    let area = &mut increment.bytes[increment.contents_start + 1..increment.contents_end - 1];
    area.fill(b'0');
    area[..hex.len()].copy_from_slice(hex.as_bytes());
    Ok(())
}

/// Concatenate the two ranges the ByteRange describes.
fn extract_ranges(bytes: &[u8], range: &[i64; 4]) -> Result<Vec<u8>> {
    let [a, b, c, d] = *range;
    let bounds_ok = a >= 0
        && b >= 0
        && c >= a + b
        && d >= 0
        && ((c + d) as usize) <= bytes.len()
        && ((a + b) as usize) <= bytes.len();
    if !bounds_ok {
        return Err(Error::PdfStructure(format!("invalid ByteRange {:?}", range)));
    }
    let mut out = Vec::with_capacity((b + d) as usize);
    out.extend_from_slice(&bytes[a as usize..(a + b) as usize]);
    out.extend_from_slice(&bytes[c as usize..(c + d) as usize]);
    Ok(out)
}

/// Strip the zero padding after a DER value using its outer length header.
fn trim_der(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < 2 {
        return Err(Error::PdfStructure("signature contents too short".to_string()));
    }
    let first_len = bytes[1];
    let total = if first_len < 0x80 {
        2 + first_len as usize
    } else {
        let n = (first_len & 0x7F) as usize;
        if n == 0 || n > 8 || bytes.len() < 2 + n {
            return Err(Error::PdfStructure("malformed DER length".to_string()));
        }
        let mut len = 0usize;
        for &b in &bytes[2..2 + n] {
            len = len
                .checked_mul(256)
                .and_then(|l| l.checked_add(b as usize))
                .ok_or_else(|| Error::PdfStructure("DER length overflow".to_string()))?;
        }
        2 + n + len
    };
    if total > bytes.len() {
        return Err(Error::PdfStructure("truncated DER in signature contents".to_string()));
    }
    Ok(&bytes[..total])
}

/// Uppercase hex, the convention for /Contents.
fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0F) as usize] as char);
    }
    out
}

/// PDF literal string with escaping.
fn write_string(s: &str) -> String {
    super::object::write_object(&Object::String(s.as_bytes().to_vec()))
}

/// Coordinates without a spurious fraction.
fn fmt_coord(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_support::minimal_pdf;
    use chrono::TimeZone;

    #[test]
    fn equal_placeholder_sizes_build_identical_revisions() {
        // The measuring pass and the final pass must see the same layout
        // whenever they reserve the same /Contents size.
        let pdf = minimal_pdf(1);
        let signer = PdfSigner::new(DigestAlgorithm::Sha256);
        let time = Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap();
        let cfg = SignConfig::default();
        let a = signer.build_increment(&pdf, b"CERT", &cfg, time, 1500).unwrap();
        let b = signer.build_increment(&pdf, b"CERT", &cfg, time, 1500).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.contents_start, b.contents_start);
        assert_eq!(a.contents_end, b.contents_end);
    }

    #[test]
    fn embedding_touches_only_the_reserved_area() {
        let pdf = minimal_pdf(1);
        let signer = PdfSigner::new(DigestAlgorithm::Sha256);
        let time = Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap();
        let cfg = SignConfig::default();
        let mut increment = signer
            .build_increment(&pdf, b"CERT", &cfg, time, 1500)
            .unwrap();
        let before = increment.bytes.clone();

        let fake_cms = vec![0xAB; 100];
        embed_contents(&mut increment, &fake_cms).unwrap();

        assert_eq!(
            increment.bytes[..increment.contents_start + 1],
            before[..increment.contents_start + 1],
        );
        assert_eq!(
            increment.bytes[increment.contents_end - 1..],
            before[increment.contents_end - 1..],
        );
        let area = &increment.bytes[increment.contents_start + 1..increment.contents_end - 1];
        assert!(area.starts_with(bytes_to_hex(&fake_cms).as_bytes()));
        assert!(area[fake_cms.len() * 2..].iter().all(|&b| b == b'0'));
    }

    #[test]
    fn hex_is_uppercase() {
        assert_eq!(bytes_to_hex(&[0x00, 0xAB, 0x5f]), "00AB5F");
    }

    #[test]
    fn extract_ranges_concatenates() {
        let data = b"0123456789";
        let out = extract_ranges(data, &[0, 3, 7, 3]).unwrap();
        assert_eq!(out, b"012789");
        assert!(extract_ranges(data, &[0, 5, 4, 10]).is_err());
        assert!(extract_ranges(data, &[0, 20, 20, 0]).is_err());
    }

    #[test]
    fn trim_der_drops_padding() {
        // SEQUENCE { } followed by padding zeros.
        let mut data = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        let expected = data.clone();
        data.extend_from_slice(&[0; 16]);
        assert_eq!(trim_der(&data).unwrap(), expected.as_slice());
    }

    #[test]
    fn trim_der_long_form() {
        let mut data = vec![0x30, 0x82, 0x01, 0x00];
        data.extend_from_slice(&vec![0xAA; 256]);
        data.extend_from_slice(&[0; 8]);
        assert_eq!(trim_der(&data).unwrap().len(), 4 + 256);
        assert!(trim_der(&[0x30]).is_err());
        assert!(trim_der(&[0x30, 0x82, 0x01]).is_err());
    }

    #[test]
    fn byte_range_patch_keeps_width() {
        let mut buf = b"xx[0000000000 0000000000 0000000000 0000000000]yy".to_vec();
        let len = buf.len();
        patch_byte_range(&mut buf, 2, 10, 20, len);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            format!("xx[{:010} {:010} {:010} {:010}]yy", 0, 10, 20, len - 20),
        );
    }
}
