//! DTD text scanner
//!
//! Turns DTD markup (an internal subset, or the text of an external subset or
//! parameter entity) into [`DtdEvent`]s. Only the declaration structure is
//! recognized; content models and attribute definitions are kept verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use super::DtdEvent;
use crate::error::{Error, Result};

static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[:A-Z_a-z\u{C0}-\u{10FFFF}][-.0-9:A-Z_a-z\u{B7}\u{C0}-\u{10FFFF}]*")
        .expect("valid name pattern")
});

static CHAR_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid char ref pattern"));

/// The parts of a `<!DOCTYPE ...>` declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctypeDecl {
    /// Root element name
    pub root: String,
    /// Public identifier of the external subset
    pub public_id: Option<String>,
    /// System identifier of the external subset
    pub system_id: Option<String>,
    /// Text between `[` and `]`
    pub internal_subset: Option<String>,
}

impl DoctypeDecl {
    /// The opening event for this DTD
    pub fn start_event(&self) -> DtdEvent {
        DtdEvent::StartDtd {
            root: self.root.clone(),
            public_id: self.public_id.clone(),
            system_id: self.system_id.clone(),
        }
    }
}

/// Split the content of a DOCTYPE declaration
///
/// `content` is everything between `<!DOCTYPE` and the closing `>`; a
/// leading `DOCTYPE` keyword is tolerated.
pub fn split_doctype(content: &str) -> Result<DoctypeDecl> {
    let trimmed = content.trim_start();
    let body = match trimmed.get(..7) {
        Some(head) if head.eq_ignore_ascii_case("DOCTYPE") => &trimmed[7..],
        _ => trimmed,
    };

    let mut cursor = Cursor::new(body, None);
    cursor.skip_ws();
    let root = cursor.name()?;
    cursor.skip_ws();

    let mut decl = DoctypeDecl {
        root,
        ..DoctypeDecl::default()
    };
    if cursor.at("SYSTEM") || cursor.at("PUBLIC") {
        let (public_id, system_id) = cursor.external_id(false)?;
        decl.public_id = public_id;
        decl.system_id = system_id;
        cursor.skip_ws();
    }
    if cursor.eat("[") {
        let start = cursor.pos;
        let end = cursor.find_subset_end()?;
        decl.internal_subset = Some(body[start..end].to_string());
        cursor.pos = end + 1;
        cursor.skip_ws();
    }
    if !cursor.done() {
        return Err(cursor.error("unexpected text after DOCTYPE"));
    }
    Ok(decl)
}

/// Scan DTD text into events
///
/// External entity declarations record `base_system_id` as their base.
pub fn scan_subset(text: &str, base_system_id: Option<&str>) -> Result<Vec<DtdEvent>> {
    let mut cursor = Cursor::new(text, base_system_id);
    let mut events = Vec::new();
    let mut open_sections = 0usize;

    loop {
        cursor.skip_ws();
        if cursor.done() {
            break;
        }
        if cursor.eat("<!--") {
            let body = cursor.until("-->")?;
            events.push(DtdEvent::Comment(body.to_string()));
        } else if cursor.eat("<?") {
            let body = cursor.until("?>")?;
            let (target, data) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
            events.push(DtdEvent::ProcessingInstruction {
                target: target.to_string(),
                data: data.trim().to_string(),
            });
        } else if cursor.eat("<![") {
            cursor.skip_ws();
            let include = if cursor.eat("INCLUDE") {
                true
            } else if cursor.eat("IGNORE") {
                false
            } else {
                return Err(cursor.error("expected INCLUDE or IGNORE"));
            };
            cursor.skip_ws();
            cursor.expect("[")?;
            events.push(DtdEvent::StartConditional { include });
            if include {
                open_sections += 1;
            } else {
                cursor.skip_ignored_section()?;
                events.push(DtdEvent::EndConditional);
            }
        } else if cursor.eat("]]>") {
            if open_sections == 0 {
                return Err(cursor.error("unbalanced ']]>'"));
            }
            open_sections -= 1;
            events.push(DtdEvent::EndConditional);
        } else if cursor.eat("<!ENTITY") {
            events.push(cursor.entity_decl()?);
        } else if cursor.eat("<!ELEMENT") {
            cursor.require_ws()?;
            let name = cursor.name()?;
            let content_model = cursor.until_close()?.trim().to_string();
            events.push(DtdEvent::ElementDecl {
                name,
                content_model,
            });
        } else if cursor.eat("<!ATTLIST") {
            cursor.require_ws()?;
            let element = cursor.name()?;
            let definitions = cursor.until_close()?.trim().to_string();
            events.push(DtdEvent::AttlistDecl {
                element,
                definitions,
            });
        } else if cursor.eat("<!NOTATION") {
            cursor.require_ws()?;
            let name = cursor.name()?;
            cursor.skip_ws();
            let (public_id, system_id) = cursor.external_id(true)?;
            cursor.skip_ws();
            cursor.expect(">")?;
            events.push(DtdEvent::NotationDecl {
                name,
                public_id,
                system_id,
            });
        } else if cursor.eat("%") {
            let name = cursor.name()?;
            cursor.expect(";")?;
            events.push(DtdEvent::ParameterEntityReference {
                name: format!("%{}", name),
            });
        } else {
            return Err(cursor.error("unexpected markup"));
        }
    }

    if open_sections > 0 {
        return Err(Error::Dtd("unterminated conditional section".to_string()));
    }
    Ok(events)
}

/// Expand character references in an entity literal
///
/// Entity and parameter-entity references are left as written.
pub fn expand_char_refs(literal: &str) -> Result<String> {
    let mut out = String::with_capacity(literal.len());
    let mut last = 0;
    for caps in CHAR_REF.captures_iter(literal) {
        let (whole, digits) = match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(digits)) => (whole, digits.as_str()),
            _ => continue,
        };
        let code = match digits.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => digits.parse::<u32>(),
        }
        .map_err(|e| Error::Dtd(format!("bad character reference {}: {}", whole.as_str(), e)))?;
        let ch = char::from_u32(code)
            .ok_or_else(|| Error::Dtd(format!("invalid character reference {}", whole.as_str())))?;
        out.push_str(&literal[last..whole.start()]);
        out.push(ch);
        last = whole.end();
    }
    out.push_str(&literal[last..]);
    Ok(out)
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    base: Option<&'a str>,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str, base: Option<&'a str>) -> Self {
        Self { src, pos: 0, base }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn done(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn at(&self, token: &str) -> bool {
        self.rest().starts_with(token)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.at(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn skip_ws(&mut self) -> bool {
        let rest = self.rest();
        let trimmed = rest.trim_start_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));
        self.pos += rest.len() - trimmed.len();
        trimmed.len() != rest.len()
    }

    fn require_ws(&mut self) -> Result<()> {
        if self.skip_ws() {
            Ok(())
        } else {
            Err(self.error("expected whitespace"))
        }
    }

    fn name(&mut self) -> Result<String> {
        match NAME.find(self.rest()) {
            Some(m) => {
                self.pos += m.end();
                Ok(m.as_str().to_string())
            }
            None => Err(self.error("expected a name")),
        }
    }

    fn quoted(&mut self) -> Result<&'a str> {
        let quote = match self.rest().chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected a quoted literal")),
        };
        self.pos += 1;
        let rest = self.rest();
        match rest.find(quote) {
            Some(end) => {
                self.pos += end + 1;
                Ok(&rest[..end])
            }
            None => Err(self.error("unterminated literal")),
        }
    }

    /// Text up to `terminator`, consuming it
    fn until(&mut self, terminator: &str) -> Result<&'a str> {
        let rest = self.rest();
        match rest.find(terminator) {
            Some(end) => {
                self.pos += end + terminator.len();
                Ok(&rest[..end])
            }
            None => Err(self.error(&format!("missing '{}'", terminator))),
        }
    }

    /// Text up to the `>` closing a declaration, skipping quoted literals
    fn until_close(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let mut quote = None;
        for (i, c) in rest.char_indices() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(c),
                (None, '>') => {
                    self.pos += i + 1;
                    return Ok(&rest[..i]);
                }
                _ => {}
            }
        }
        Err(self.error("unterminated declaration"))
    }

    /// Position of the `]` closing an internal subset
    fn find_subset_end(&self) -> Result<usize> {
        let mut quote = None;
        let mut in_comment = false;
        let bytes = self.src.as_bytes();
        let mut i = self.pos;
        while i < bytes.len() {
            let rest = &bytes[i..];
            if in_comment {
                if rest.starts_with(b"-->") {
                    in_comment = false;
                    i += 3;
                    continue;
                }
            } else if let Some(q) = quote {
                if bytes[i] == q {
                    quote = None;
                }
            } else if rest.starts_with(b"<!--") {
                in_comment = true;
                i += 4;
                continue;
            } else if bytes[i] == b'"' || bytes[i] == b'\'' {
                quote = Some(bytes[i]);
            } else if bytes[i] == b']' {
                return Ok(i);
            }
            i += 1;
        }
        Err(self.error("unterminated internal subset"))
    }

    fn skip_ignored_section(&mut self) -> Result<()> {
        let mut depth = 1usize;
        while !self.done() {
            if self.eat("<![") {
                depth += 1;
            } else if self.eat("]]>") {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            } else {
                let step = self.rest().chars().next().map_or(1, char::len_utf8);
                self.pos += step;
            }
        }
        Err(self.error("unterminated IGNORE section"))
    }

    /// `SYSTEM "sys"` or `PUBLIC "pub" "sys"`
    ///
    /// Notations may omit the system literal after a public one.
    fn external_id(&mut self, system_optional: bool) -> Result<(Option<String>, Option<String>)> {
        if self.eat("SYSTEM") {
            self.require_ws()?;
            let system = self.quoted()?;
            Ok((None, Some(system.to_string())))
        } else if self.eat("PUBLIC") {
            self.require_ws()?;
            let public = self.quoted()?.to_string();
            let had_ws = self.skip_ws();
            if had_ws && matches!(self.rest().chars().next(), Some('"' | '\'')) {
                let system = self.quoted()?;
                Ok((Some(public), Some(system.to_string())))
            } else if system_optional {
                Ok((Some(public), None))
            } else {
                Err(self.error("expected a system literal"))
            }
        } else {
            Err(self.error("expected SYSTEM or PUBLIC"))
        }
    }

    fn entity_decl(&mut self) -> Result<DtdEvent> {
        self.require_ws()?;
        let parameter = if self.at("%") {
            self.pos += 1;
            self.require_ws()?;
            true
        } else {
            false
        };
        let bare = self.name()?;
        let name = if parameter { format!("%{}", bare) } else { bare };
        self.require_ws()?;

        if matches!(self.rest().chars().next(), Some('"' | '\'')) {
            let literal = self.quoted()?;
            self.skip_ws();
            self.expect(">")?;
            return Ok(DtdEvent::InternalEntityDecl {
                name,
                text: expand_char_refs(literal)?,
            });
        }

        let (public_id, system_id) = self.external_id(false)?;
        let system_id = system_id.unwrap_or_default();
        let had_ws = self.skip_ws();
        if had_ws && self.eat("NDATA") {
            if parameter {
                return Err(self.error("parameter entity cannot be unparsed"));
            }
            self.require_ws()?;
            let notation = self.name()?;
            self.skip_ws();
            self.expect(">")?;
            return Ok(DtdEvent::UnparsedEntityDecl {
                name,
                public_id,
                system_id,
                notation,
            });
        }
        self.expect(">")?;
        Ok(DtdEvent::ExternalEntityDecl {
            name,
            public_id,
            system_id,
            base_system_id: self.base.map(str::to_string),
        })
    }

    fn error(&self, what: &str) -> Error {
        let snippet: String = self.rest().chars().take(24).collect();
        Error::Dtd(format!("{} at offset {} near {:?}", what, self.pos, snippet))
    }
}
