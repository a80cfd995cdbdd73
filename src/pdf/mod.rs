//! PDF parsing and incremental signing.
//!
//! The parser covers exactly what signing needs: locating objects, the page
//! tree, existing signature fields and the trailer. Content streams are
//! never decoded and existing bytes are never rewritten.

pub mod document;
pub mod object;
pub mod placement;
pub mod signer;

pub use document::{PageInfo, PdfDocument, SignatureDict};
pub use object::{Object, ObjectRef};
pub use placement::Rect;
pub use signer::{PdfSigner, SelfCheckReport};

/// Whether the bytes look like a PDF.
pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for small but structurally honest PDF files.

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

    #[test]
    fn minimal_pdf_has_header_and_eof() {
        let pdf = minimal_pdf(1);
        assert!(pdf.starts_with(b"%PDF"));
        assert!(pdf.ends_with(b"%%EOF\n"));
    }
}
