//! PDF object model and parser.
//!
//! Covers the subset of COS syntax needed to prepare an incremental
//! signature update: dictionaries, arrays, names, numbers, strings and
//! indirect references. Stream data is skipped, only the stream dictionary
//! is retained; nothing here decodes page content.

use std::collections::HashMap;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while, take_while1},
    character::complete::char,
    combinator::{opt, value},
    multi::many0,
    sequence::{delimited, preceded, tuple},
    IResult,
};

/// Reference to an indirect object (`10 0 R`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object number.
    pub id: u32,
    /// Generation number.
    pub gen: u16,
}

impl ObjectRef {
    /// Create a reference.
    pub fn new(id: u32, gen: u16) -> Self {
        Self { id, gen }
    }
}

/// A parsed PDF object.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// null keyword
    Null,
    /// true / false
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Real number
    Real(f64),
    /// Literal or hex string, escape/hex decoding already applied
    String(Vec<u8>),
    /// Name without the leading slash
    Name(String),
    /// Array of objects
    Array(Vec<Object>),
    /// Dictionary keyed by name
    Dictionary(HashMap<String, Object>),
    /// Indirect reference
    Reference(ObjectRef),
}

impl Object {
    /// Integer value, also accepting reals with no fraction.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Object::Integer(i) => Some(*i),
            Object::Real(r) if r.fract() == 0.0 => Some(*r as i64),
            _ => None,
        }
    }

    /// Numeric value as f64.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Object::Integer(i) => Some(*i as f64),
            Object::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Name payload.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Object::Name(n) => Some(n),
            _ => None,
        }
    }

    /// Dictionary payload.
    pub fn as_dict(&self) -> Option<&HashMap<String, Object>> {
        match self {
            Object::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Array payload.
    pub fn as_array(&self) -> Option<&Vec<Object>> {
        match self {
            Object::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Reference payload.
    pub fn as_reference(&self) -> Option<ObjectRef> {
        match self {
            Object::Reference(r) => Some(*r),
            _ => None,
        }
    }

    /// String payload (decoded bytes).
    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n' | 0x00 | 0x0C)
}

fn is_delimiter(c: u8) -> bool {
    matches!(c, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn comment(input: &[u8]) -> IResult<&[u8], ()> {
    value((), preceded(char('%'), take_till(|c| c == b'\r' || c == b'\n')))(input)
}

/// Skip whitespace and comments.
pub(crate) fn skip_ws(input: &[u8]) -> IResult<&[u8], ()> {
    let mut rest = input;
    loop {
        let (after_ws, _) = take_while(is_whitespace)(rest)?;
        match comment(after_ws) {
            Ok((after_comment, ())) => rest = after_comment,
            Err(_) => return Ok((after_ws, ())),
        }
    }
}

fn name(input: &[u8]) -> IResult<&[u8], Object> {
    let (rest, raw) = preceded(
        char('/'),
        take_while(|c: u8| !is_whitespace(c) && !is_delimiter(c)),
    )(input)?;
    // decode #XX escapes
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'#' && i + 2 < raw.len() {
            let hex = std::str::from_utf8(&raw[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }
        out.push(raw[i] as char);
        i += 1;
    }
    Ok((rest, Object::Name(out)))
}

fn literal_string(input: &[u8]) -> IResult<&[u8], Object> {
    let (mut rest, _) = char('(')(input)?;
    let mut out = Vec::new();
    let mut depth = 1usize;
    while let Some((&c, tail)) = rest.split_first() {
        rest = tail;
        match c {
            b'\\' => {
                if let Some((&esc, tail)) = rest.split_first() {
                    rest = tail;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0C),
                        b'0'..=b'7' => {
                            let mut code = (esc - b'0') as u32;
                            for _ in 0..2 {
                                match rest.split_first() {
                                    Some((&d @ b'0'..=b'7', tail)) => {
                                        code = code * 8 + (d - b'0') as u32;
                                        rest = tail;
                                    }
                                    _ => break,
                                }
                            }
                            out.push(code as u8);
                        }
                        other => out.push(other),
                    }
                }
            }
            b'(' => {
                depth += 1;
                out.push(c);
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((rest, Object::String(out)));
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::TakeUntil)))
}

fn hex_string(input: &[u8]) -> IResult<&[u8], Object> {
    let (rest, raw) = delimited(
        char('<'),
        take_while(|c: u8| c != b'>'),
        char('>'),
    )(input)?;
    let digits: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    let mut out = Vec::with_capacity(digits.len() / 2 + 1);
    for pair in digits.chunks(2) {
        let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
        let lo = if pair.len() == 2 {
            (pair[1] as char).to_digit(16).unwrap_or(0) as u8
        } else {
            0
        };
        out.push((hi << 4) | lo);
    }
    Ok((rest, Object::String(out)))
}

fn number(input: &[u8]) -> IResult<&[u8], Object> {
    let (rest, (sign, digits)) = tuple((
        opt(alt((char('+'), char('-')))),
        take_while1(|c: u8| c.is_ascii_digit() || c == b'.'),
    ))(input)?;
    let text = std::str::from_utf8(digits)
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    let negative = sign == Some('-');
    if text.contains('.') {
        let mut v: f64 = text
            .parse()
            .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float)))?;
        if negative {
            v = -v;
        }
        Ok((rest, Object::Real(v)))
    } else {
        let mut v: i64 = text
            .parse()
            .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
        if negative {
            v = -v;
        }
        Ok((rest, Object::Integer(v)))
    }
}

/// `N G R` takes priority over a bare integer.
fn reference(input: &[u8]) -> IResult<&[u8], Object> {
    let (rest, (id, _, gen, _, _)) = tuple((
        take_while1(|c: u8| c.is_ascii_digit()),
        skip_ws,
        take_while1(|c: u8| c.is_ascii_digit()),
        skip_ws,
        char('R'),
    ))(input)?;
    // R must be a standalone keyword
    if let Some(&next) = rest.first() {
        if !is_whitespace(next) && !is_delimiter(next) {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
    }
    let id: u32 = std::str::from_utf8(id)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    let gen: u16 = std::str::from_utf8(gen)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((rest, Object::Reference(ObjectRef::new(id, gen))))
}

fn array(input: &[u8]) -> IResult<&[u8], Object> {
    let (input, _) = char('[')(input)?;
    let (input, items) = many0(preceded(skip_ws, object))(input)?;
    let (input, _) = skip_ws(input)?;
    let (input, _) = char(']')(input)?;
    Ok((input, Object::Array(items)))
}

fn dictionary(input: &[u8]) -> IResult<&[u8], Object> {
    let (input, _) = tag("<<")(input)?;
    let (input, pairs) = many0(tuple((preceded(skip_ws, name), preceded(skip_ws, object))))(input)?;
    let (input, _) = skip_ws(input)?;
    let (input, _) = tag(">>")(input)?;
    let mut dict = HashMap::with_capacity(pairs.len());
    for (key, val) in pairs {
        if let Object::Name(k) = key {
            dict.insert(k, val);
        }
    }
    Ok((input, Object::Dictionary(dict)))
}

fn keyword(input: &[u8]) -> IResult<&[u8], Object> {
    alt((
        value(Object::Boolean(true), tag("true")),
        value(Object::Boolean(false), tag("false")),
        value(Object::Null, tag("null")),
    ))(input)
}

/// Parse a single object.
pub fn object(input: &[u8]) -> IResult<&[u8], Object> {
    alt((
        dictionary,
        hex_string,
        literal_string,
        array,
        name,
        keyword,
        reference,
        number,
    ))(input)
}

/// An indirect object definition (`N G obj ... endobj`).
#[derive(Debug, Clone)]
pub struct IndirectObject {
    /// The object's number and generation.
    pub reference: ObjectRef,
    /// Parsed body. Stream objects keep only their dictionary.
    pub body: Object,
    /// Whether a stream followed the dictionary.
    pub has_stream: bool,
}

/// Parse an indirect object starting at `input`, skipping stream payloads.
pub fn indirect_object(input: &[u8]) -> IResult<&[u8], IndirectObject> {
    let (input, _) = skip_ws(input)?;
    let (input, (id, _, gen, _, _)) = tuple((
        take_while1(|c: u8| c.is_ascii_digit()),
        skip_ws,
        take_while1(|c: u8| c.is_ascii_digit()),
        skip_ws,
        tag("obj"),
    ))(input)?;
    let id: u32 = std::str::from_utf8(id)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    let gen: u16 = std::str::from_utf8(gen)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;

    let (input, _) = skip_ws(input)?;
    let (input, body) = object(input)?;
    let (input, _) = skip_ws(input)?;

    // Skip stream payloads; the /Length entry may be an unresolved
    // reference, so scan for the endstream keyword instead.
    let (input, has_stream) = match tag::<_, _, nom::error::Error<&[u8]>>("stream")(input) {
        Ok((after, _)) => {
            let end = find_subslice(after, b"endstream").ok_or(nom::Err::Error(
                nom::error::Error::new(input, nom::error::ErrorKind::TakeUntil),
            ))?;
            (&after[end + b"endstream".len()..], true)
        }
        Err(_) => (input, false),
    };
    let (input, _) = skip_ws(input)?;
    let (input, _) = opt(tag("endobj"))(input)?;
    Ok((input, IndirectObject { reference: ObjectRef::new(id, gen), body, has_stream }))
}

/// First occurrence of `needle` in `haystack`.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Last occurrence of `needle` in `haystack`.
pub(crate) fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Serialize an object back to COS syntax.
pub fn write_object(obj: &Object) -> String {
    match obj {
        Object::Null => "null".to_string(),
        Object::Boolean(b) => b.to_string(),
        Object::Integer(i) => i.to_string(),
        Object::Real(r) => {
            if r.fract() == 0.0 {
                format!("{}", *r as i64)
            } else {
                format!("{}", r)
            }
        }
        Object::String(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('(');
            for &b in s {
                match b {
                    b'\\' => out.push_str("\\\\"),
                    b'(' => out.push_str("\\("),
                    b')' => out.push_str("\\)"),
                    b'\n' => out.push_str("\\n"),
                    b'\r' => out.push_str("\\r"),
                    0x20..=0x7E => out.push(b as char),
                    other => out.push_str(&format!("\\{:03o}", other)),
                }
            }
            out.push(')');
            out
        }
        Object::Name(n) => format!("/{}", n),
        Object::Array(items) => {
            let inner: Vec<String> = items.iter().map(write_object).collect();
            format!("[{}]", inner.join(" "))
        }
        Object::Dictionary(dict) => {
            // Sorted for reproducible output.
            let mut keys: Vec<&String> = dict.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("/{} {}", k, write_object(&dict[*k])))
                .collect();
            format!("<< {} >>", inner.join(" "))
        }
        Object::Reference(r) => format!("{} {} R", r.id, r.gen),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Object {
        let (_, obj) = object(input).unwrap();
        obj
    }

    #[test]
    fn parses_scalars() {
        assert_eq!(parse(b"42"), Object::Integer(42));
        assert_eq!(parse(b"-17"), Object::Integer(-17));
        assert_eq!(parse(b"3.5"), Object::Real(3.5));
        assert_eq!(parse(b"/Type"), Object::Name("Type".to_string()));
        assert_eq!(parse(b"true"), Object::Boolean(true));
        assert_eq!(parse(b"null"), Object::Null);
    }

    #[test]
    fn parses_strings() {
        assert_eq!(parse(b"(hello)"), Object::String(b"hello".to_vec()));
        assert_eq!(parse(b"(a\\(b\\)c)"), Object::String(b"a(b)c".to_vec()));
        assert_eq!(parse(b"(nest (ed))"), Object::String(b"nest (ed)".to_vec()));
        assert_eq!(parse(b"<48656C6C6F>"), Object::String(b"Hello".to_vec()));
        assert_eq!(parse(b"<48 65 6C>"), Object::String(b"Hel".to_vec()));
    }

    #[test]
    fn parses_references_and_arrays() {
        assert_eq!(
            parse(b"12 0 R"),
            Object::Reference(ObjectRef::new(12, 0))
        );
        let arr = parse(b"[1 2 0 R 3]");
        // "2 0 R" binds as a reference, leaving integers 1 and 3.
        assert_eq!(
            arr,
            Object::Array(vec![
                Object::Integer(1),
                Object::Reference(ObjectRef::new(2, 0)),
                Object::Integer(3),
            ])
        );
    }

    #[test]
    fn parses_dictionaries() {
        let obj = parse(b"<< /Type /Page /MediaBox [0 0 612 792] /Parent 2 0 R >>");
        let dict = obj.as_dict().unwrap();
        assert_eq!(dict["Type"].as_name(), Some("Page"));
        assert_eq!(dict["MediaBox"].as_array().unwrap().len(), 4);
        assert_eq!(dict["Parent"].as_reference(), Some(ObjectRef::new(2, 0)));
    }

    #[test]
    fn parses_indirect_object_with_stream() {
        let data = b"7 0 obj\n<< /Length 5 >>\nstream\nhello\nendstream\nendobj\n";
        let (_, obj) = indirect_object(data).unwrap();
        assert_eq!(obj.reference, ObjectRef::new(7, 0));
        assert!(obj.has_stream);
        assert!(obj.body.as_dict().is_some());
    }

    #[test]
    fn write_round_trips_structure() {
        let src = b"<< /A [1 2 3] /B (text) /C /Name >>";
        let obj = parse(src);
        let written = write_object(&obj);
        assert_eq!(parse(written.as_bytes()), obj);
    }
}
