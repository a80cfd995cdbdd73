//! Scoped PDF document model.
//!
//! Built by scanning the byte stream for `N G obj` definitions rather than
//! trusting the cross-reference table, which survives files whose xref is
//! stale or rebuilt. Later definitions of the same object number override
//! earlier ones, mirroring how incremental updates shadow old revisions.

use std::collections::HashMap;

use log::{debug, warn};

use super::object::{
    find_subslice, indirect_object, object, rfind_subslice, skip_ws, Object, ObjectRef,
};
use super::placement::Rect;
use crate::error::{Error, Result};

/// US Letter, the fallback when no MediaBox can be resolved.
const DEFAULT_MEDIA_BOX: Rect = Rect { llx: 0.0, lly: 0.0, urx: 612.0, ury: 792.0 };

/// A page relevant to signing.
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// Object number and generation of the page.
    pub reference: ObjectRef,
    /// Effective MediaBox, inherited from the page tree when absent.
    pub media_box: Rect,
}

/// An existing signature dictionary found in the document.
#[derive(Debug, Clone)]
pub struct SignatureDict {
    /// The four ByteRange numbers.
    pub byte_range: [i64; 4],
    /// DER CMS from /Contents, trailing padding included.
    pub contents: Vec<u8>,
}

/// Parsed view over a PDF byte stream.
#[derive(Debug)]
pub struct PdfDocument {
    objects: HashMap<u32, (u16, Object)>,
    max_object_id: u32,
    catalog_id: Option<ObjectRef>,
    prev_startxref: Option<usize>,
}

impl PdfDocument {
    /// Scan `bytes` and build the document model.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if !bytes.starts_with(b"%PDF") {
            return Err(Error::PdfStructure("missing %PDF header".to_string()));
        }
        let mut objects: HashMap<u32, (u16, Object)> = HashMap::new();
        let mut max_object_id = 0;

        let mut pos = 0;
        while let Some(found) = find_subslice(&bytes[pos..], b"obj") {
            let at = pos + found;
            pos = at + 3;
            if !is_object_keyword(bytes, at) {
                continue;
            }
            let Some(start) = definition_start(bytes, at) else { continue };
            match indirect_object(&bytes[start..]) {
                Ok((_, parsed)) => {
                    max_object_id = max_object_id.max(parsed.reference.id);
                    objects.insert(parsed.reference.id, (parsed.reference.gen, parsed.body));
                }
                Err(_) => {
                    debug!("unparseable object definition at offset {}", start);
                }
            }
        }
        if objects.is_empty() {
            return Err(Error::PdfStructure("no indirect objects found".to_string()));
        }

        let catalog_id = locate_catalog(bytes, &objects);
        if catalog_id.is_none() {
            warn!("document has no reachable /Type /Catalog");
        }
        let prev_startxref = locate_startxref(bytes);

        Ok(Self { objects, max_object_id, catalog_id, prev_startxref })
    }

    /// Highest object number in use.
    pub fn max_object_id(&self) -> u32 {
        self.max_object_id
    }

    /// Offset the last startxref points at, for the /Prev trailer entry.
    pub fn prev_startxref(&self) -> Option<usize> {
        self.prev_startxref
    }

    /// The document catalog reference.
    pub fn catalog_ref(&self) -> Result<ObjectRef> {
        self.catalog_id
            .ok_or_else(|| Error::PdfStructure("document catalog not found".to_string()))
    }

    /// Fetch an object body by number.
    pub fn get(&self, id: u32) -> Option<&Object> {
        self.objects.get(&id).map(|(_, obj)| obj)
    }

    /// Generation number of an object.
    pub fn generation(&self, id: u32) -> u16 {
        self.objects.get(&id).map(|(gen, _)| *gen).unwrap_or(0)
    }

    /// Follow references until a direct object is reached.
    pub fn resolve<'a>(&'a self, obj: &'a Object) -> &'a Object {
        let mut current = obj;
        for _ in 0..32 {
            match current {
                Object::Reference(r) => match self.get(r.id) {
                    Some(target) => current = target,
                    None => return current,
                },
                _ => return current,
            }
        }
        current
    }

    fn dict_of<'a>(&'a self, obj: &'a Object) -> Option<&'a HashMap<String, Object>> {
        self.resolve(obj).as_dict()
    }

    /// Pages in document order, walking the page tree from the catalog.
    pub fn pages(&self) -> Result<Vec<PageInfo>> {
        let catalog = self.catalog_ref()?;
        let root = self
            .get(catalog.id)
            .and_then(|o| o.as_dict())
            .and_then(|d| d.get("Pages"))
            .ok_or_else(|| Error::PdfStructure("catalog has no /Pages".to_string()))?;
        let mut pages = Vec::new();
        self.collect_pages(root, None, &mut pages, 0)?;
        if pages.is_empty() {
            return Err(Error::PdfStructure("page tree holds no pages".to_string()));
        }
        Ok(pages)
    }

    fn collect_pages(
        &self,
        node: &Object,
        inherited_box: Option<Rect>,
        out: &mut Vec<PageInfo>,
        depth: usize,
    ) -> Result<()> {
        if depth > 64 {
            return Err(Error::PdfStructure("page tree recursion too deep".to_string()));
        }
        let node_ref = node.as_reference();
        let dict = self
            .dict_of(node)
            .ok_or_else(|| Error::PdfStructure("page tree node is not a dictionary".to_string()))?;
        let media_box = dict
            .get("MediaBox")
            .and_then(|b| rect_from_array(self.resolve(b)))
            .or(inherited_box);

        match dict.get("Type").and_then(|t| t.as_name()) {
            Some("Page") => {
                let reference = node_ref
                    .ok_or_else(|| Error::PdfStructure("page without an object number".to_string()))?;
                out.push(PageInfo {
                    reference,
                    media_box: media_box.unwrap_or(DEFAULT_MEDIA_BOX),
                });
            }
            _ => {
                let kids = dict
                    .get("Kids")
                    .and_then(|k| self.resolve(k).as_array())
                    .ok_or_else(|| Error::PdfStructure("page tree node has no /Kids".to_string()))?;
                for kid in kids {
                    self.collect_pages(kid, media_box, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// The page to sign: 1-based `page_num`, anything out of range or
    /// non-positive means the last page.
    pub fn page_to_sign(&self, page_num: i32) -> Result<PageInfo> {
        let pages = self.pages()?;
        let index = if page_num <= 0 || page_num as usize > pages.len() {
            pages.len() - 1
        } else {
            page_num as usize - 1
        };
        Ok(pages[index].clone())
    }

    /// Rects of existing signature widgets placed on `page`.
    ///
    /// Widgets without a /P entry cannot be attributed to a page and are
    /// conservatively included.
    pub fn signature_widget_rects(&self, page: ObjectRef) -> Vec<Rect> {
        let mut rects = Vec::new();
        for (_, (_, obj)) in self.objects.iter() {
            let Some(dict) = obj.as_dict() else { continue };
            if dict.get("FT").and_then(|f| f.as_name()) != Some("Sig") {
                continue;
            }
            if let Some(p) = dict.get("P").and_then(|p| p.as_reference()) {
                if p.id != page.id {
                    continue;
                }
            }
            if let Some(rect) = dict.get("Rect").and_then(|r| rect_from_array(self.resolve(r))) {
                rects.push(rect);
            }
        }
        rects
    }

    /// Existing /Type /Sig dictionaries carrying ByteRange and Contents.
    pub fn signature_dicts(&self) -> Vec<SignatureDict> {
        let mut sigs = Vec::new();
        for (_, (_, obj)) in self.objects.iter() {
            let Some(dict) = obj.as_dict() else { continue };
            if dict.get("Type").and_then(|t| t.as_name()) != Some("Sig") {
                continue;
            }
            let Some(range) = dict.get("ByteRange").and_then(|b| self.resolve(b).as_array())
            else {
                continue;
            };
            let numbers: Vec<i64> = range.iter().filter_map(|n| n.as_integer()).collect();
            let Ok(byte_range) = <[i64; 4]>::try_from(numbers) else { continue };
            let Some(contents) = dict.get("Contents").and_then(|c| c.as_string()) else {
                continue;
            };
            sigs.push(SignatureDict { byte_range, contents: contents.to_vec() });
        }
        sigs
    }

    /// References already listed in the AcroForm /Fields array.
    pub fn acroform_fields(&self) -> Vec<Object> {
        self.catalog_id
            .and_then(|c| self.get(c.id))
            .and_then(|o| o.as_dict())
            .and_then(|d| d.get("AcroForm"))
            .and_then(|af| self.dict_of(af))
            .and_then(|d| d.get("Fields"))
            .and_then(|f| self.resolve(f).as_array())
            .cloned()
            .unwrap_or_default()
    }

    /// Annotation entries of a page (references or inline dicts).
    pub fn page_annots(&self, page: ObjectRef) -> Vec<Object> {
        self.get(page.id)
            .and_then(|o| o.as_dict())
            .and_then(|d| d.get("Annots"))
            .and_then(|a| self.resolve(a).as_array())
            .cloned()
            .unwrap_or_default()
    }
}

fn rect_from_array(obj: &Object) -> Option<Rect> {
    let arr = obj.as_array()?;
    if arr.len() != 4 {
        return None;
    }
    let mut v = [0.0f64; 4];
    for (slot, item) in v.iter_mut().zip(arr) {
        *slot = item.as_real()?;
    }
    Some(Rect::new(v[0], v[1], v[2], v[3]))
}

/// `obj` at `at` must be a standalone keyword preceded by `N G `.
fn is_object_keyword(bytes: &[u8], at: usize) -> bool {
    let before = at.checked_sub(1).map(|i| bytes[i]);
    let after = bytes.get(at + 3);
    let ws = |c: &u8| matches!(c, b' ' | b'\t' | b'\r' | b'\n' | 0x00 | 0x0C);
    matches!(before, Some(ref c) if ws(c)) && matches!(after, Some(c) if ws(c) || *c == b'<')
}

/// Walk backwards over `N G ` to the start of the definition.
fn definition_start(bytes: &[u8], obj_keyword: usize) -> Option<usize> {
    let mut i = obj_keyword;
    let mut fields = 0;
    while fields < 2 {
        // skip whitespace
        while i > 0 && bytes[i - 1].is_ascii_whitespace() {
            i -= 1;
        }
        let end = i;
        while i > 0 && bytes[i - 1].is_ascii_digit() {
            i -= 1;
        }
        if i == end {
            return None;
        }
        fields += 1;
    }
    Some(i)
}

/// Prefer the /Root entry of the last trailer; fall back to scanning for a
/// /Type /Catalog object.
fn locate_catalog(bytes: &[u8], objects: &HashMap<u32, (u16, Object)>) -> Option<ObjectRef> {
    let mut search_end = bytes.len();
    while let Some(at) = rfind_subslice(&bytes[..search_end], b"/Root") {
        let after = &bytes[at + b"/Root".len()..];
        if let Ok((after_ws, ())) = skip_ws(after) {
            if let Ok((_, obj)) = object(after_ws) {
                if let Some(r) = obj.as_reference() {
                    if objects.contains_key(&r.id) {
                        return Some(r);
                    }
                }
            }
        }
        search_end = at;
    }
    objects
        .iter()
        .filter(|(_, (_, obj))| {
            obj.as_dict()
                .and_then(|d| d.get("Type"))
                .and_then(|t| t.as_name())
                == Some("Catalog")
        })
        .map(|(id, (gen, _))| ObjectRef::new(*id, *gen))
        .max_by_key(|r| r.id)
}

fn locate_startxref(bytes: &[u8]) -> Option<usize> {
    let at = rfind_subslice(bytes, b"startxref")?;
    let after = &bytes[at + b"startxref".len()..];
    let (after_ws, ()) = skip_ws(after).ok()?;
    let digits: Vec<u8> = after_ws
        .iter()
        .copied()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_support::minimal_pdf;

    #[test]
    fn parses_minimal_document() {
        let pdf = minimal_pdf(2);
        let doc = PdfDocument::parse(&pdf).unwrap();
        assert!(doc.max_object_id() >= 4);
        let pages = doc.pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].media_box, Rect::new(0.0, 0.0, 595.0, 842.0));
        assert!(doc.prev_startxref().is_some());
    }

    #[test]
    fn page_selection_clamps_to_last() {
        let pdf = minimal_pdf(3);
        let doc = PdfDocument::parse(&pdf).unwrap();
        let pages = doc.pages().unwrap();
        assert_eq!(doc.page_to_sign(-1).unwrap().reference, pages[2].reference);
        assert_eq!(doc.page_to_sign(0).unwrap().reference, pages[2].reference);
        assert_eq!(doc.page_to_sign(99).unwrap().reference, pages[2].reference);
        assert_eq!(doc.page_to_sign(2).unwrap().reference, pages[1].reference);
    }

    #[test]
    fn non_pdf_is_rejected() {
        assert!(PdfDocument::parse(b"not a pdf").is_err());
    }
}
