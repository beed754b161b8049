//! HTML parsing and normalization on top of the html5gum tokenizer.
//!
//! Parsing is lenient the way browsers are (unmatched closing tags are
//! dropped with a warning, mismatched nesting closes the intervening
//! elements), but tokenizer-level errors are reported as
//! `MalformedMarkup` since they prevent a canonical document from being
//! constructed at all.
//!
//! The tokenizer is driven through `OrderedEmitter` rather than
//! html5gum's `DefaultEmitter`: the latter collects attributes into a
//! `BTreeMap`, which would alphabetize them and break the document
//! layer's attribute order invariant.

use std::collections::{BTreeSet, VecDeque};
use std::mem;

use html5gum::{Emitter, Error, HtmlString, State, Tokenizer};
use kstring::KString;
use sutil::warn;

use crate::{Dom, DomError, NodeId, is_void_tag};

/// Start tags carry their attributes as an encounter-ordered list.
/// Doctype payloads are not collected; the canonical doctype is
/// regenerated on dump anyway.
enum ParseToken {
    StartTag {
        name: HtmlString,
        attrs: Vec<(HtmlString, HtmlString)>,
        self_closing: bool,
    },
    EndTag {
        name: HtmlString,
    },
    String(HtmlString),
    Comment(HtmlString),
    Doctype,
    Error(Error),
}

/// html5gum's `DefaultEmitter` rebuilt with ordered attributes
/// (first occurrence wins, duplicates are reported like the original).
#[derive(Default)]
struct OrderedEmitter {
    current_characters: HtmlString,
    current_token: Option<ParseToken>,
    last_start_tag: HtmlString,
    current_attribute: Option<(HtmlString, HtmlString)>,
    seen_end_tag_attributes: BTreeSet<HtmlString>,
    emitted_tokens: VecDeque<ParseToken>,
}

impl OrderedEmitter {
    fn emit_token(&mut self, token: ParseToken) {
        self.flush_current_characters();
        self.emitted_tokens.push_front(token);
    }

    fn flush_current_attribute(&mut self) {
        if let Some((k, v)) = self.current_attribute.take() {
            match self.current_token {
                Some(ParseToken::StartTag { ref mut attrs, .. }) => {
                    if attrs.iter().any(|(name, _)| *name == k) {
                        self.emit_error(Error::DuplicateAttribute);
                    } else {
                        attrs.push((k, v));
                    }
                }
                Some(ParseToken::EndTag { .. }) => {
                    if !self.seen_end_tag_attributes.insert(k) {
                        self.emit_error(Error::DuplicateAttribute);
                    }
                }
                _ => (),
            }
        }
    }

    fn flush_current_characters(&mut self) {
        if self.current_characters.is_empty() {
            return;
        }
        let s = mem::take(&mut self.current_characters);
        self.emit_token(ParseToken::String(s));
    }
}

impl Emitter for OrderedEmitter {
    type Token = ParseToken;

    fn set_last_start_tag(&mut self, last_start_tag: Option<&[u8]>) {
        self.last_start_tag.clear();
        self.last_start_tag
            .extend(last_start_tag.unwrap_or_default());
    }

    fn emit_eof(&mut self) {
        self.flush_current_characters();
    }

    fn emit_error(&mut self, error: Error) {
        self.emitted_tokens.push_front(ParseToken::Error(error));
    }

    fn pop_token(&mut self) -> Option<ParseToken> {
        self.emitted_tokens.pop_back()
    }

    fn emit_string(&mut self, s: &[u8]) {
        self.current_characters.extend(s);
    }

    fn init_start_tag(&mut self) {
        self.current_token = Some(ParseToken::StartTag {
            name: HtmlString::default(),
            attrs: Vec::new(),
            self_closing: false,
        });
    }

    fn init_end_tag(&mut self) {
        self.current_token = Some(ParseToken::EndTag {
            name: HtmlString::default(),
        });
        self.seen_end_tag_attributes.clear();
    }

    fn init_comment(&mut self) {
        self.current_token = Some(ParseToken::Comment(HtmlString::default()));
    }

    fn emit_current_tag(&mut self) -> Option<State> {
        self.flush_current_attribute();
        let token = self
            .current_token
            .take()
            .expect("current token is a tag when emit_current_tag is called");
        match &token {
            ParseToken::EndTag { .. } => {
                if !self.seen_end_tag_attributes.is_empty() {
                    self.emit_error(Error::EndTagWithAttributes);
                }
                self.seen_end_tag_attributes.clear();
                self.set_last_start_tag(None);
            }
            ParseToken::StartTag { name, .. } => {
                let name = name.clone();
                self.set_last_start_tag(Some(name.as_slice()));
            }
            _ => (),
        }
        self.emit_token(token);
        // No state switching: same as the default emitter's default.
        None
    }

    fn emit_current_comment(&mut self) {
        let comment = self
            .current_token
            .take()
            .expect("current token is a comment when emit_current_comment is called");
        self.emit_token(comment);
    }

    fn emit_current_doctype(&mut self) {
        let doctype = self
            .current_token
            .take()
            .expect("current token is a doctype when emit_current_doctype is called");
        self.emit_token(doctype);
    }

    fn set_self_closing(&mut self) {
        match self.current_token {
            Some(ParseToken::StartTag {
                ref mut self_closing,
                ..
            }) => *self_closing = true,
            Some(ParseToken::EndTag { .. }) => {
                self.emit_error(Error::EndTagWithTrailingSolidus);
            }
            _ => (),
        }
    }

    fn set_force_quirks(&mut self) {}

    fn push_tag_name(&mut self, s: &[u8]) {
        match self.current_token {
            Some(
                ParseToken::StartTag { ref mut name, .. }
                | ParseToken::EndTag { ref mut name },
            ) => {
                name.extend(s);
            }
            _ => (),
        }
    }

    fn push_comment(&mut self, s: &[u8]) {
        if let Some(ParseToken::Comment(ref mut data)) = self.current_token {
            data.extend(s);
        }
    }

    fn push_doctype_name(&mut self, _s: &[u8]) {}

    fn init_doctype(&mut self) {
        self.current_token = Some(ParseToken::Doctype);
    }

    fn init_attribute(&mut self) {
        self.flush_current_attribute();
        self.current_attribute = Some(Default::default());
    }

    fn push_attribute_name(&mut self, s: &[u8]) {
        if let Some((ref mut name, _)) = self.current_attribute {
            name.extend(s);
        }
    }

    fn push_attribute_value(&mut self, s: &[u8]) {
        if let Some((_, ref mut value)) = self.current_attribute {
            value.extend(s);
        }
    }

    fn set_doctype_public_identifier(&mut self, _value: &[u8]) {}
    fn set_doctype_system_identifier(&mut self, _value: &[u8]) {}
    fn push_doctype_public_identifier(&mut self, _s: &[u8]) {}
    fn push_doctype_system_identifier(&mut self, _s: &[u8]) {}

    fn current_is_appropriate_end_tag_token(&mut self) -> bool {
        match self.current_token {
            Some(ParseToken::EndTag { ref name }) => {
                !self.last_start_tag.is_empty() && self.last_start_tag == *name
            }
            _ => false,
        }
    }
}

fn kstring(bytes: &[u8]) -> Result<KString, DomError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| DomError::MalformedMarkup(format!("invalid UTF-8: {e}")))?;
    Ok(KString::from_ref(s))
}

/// Parse `src` into `dom`, returning the top-level nodes in document
/// order. The nodes are detached; the caller decides where they go.
pub fn parse_fragment(dom: &mut Dom, src: &str) -> Result<Vec<NodeId>, DomError> {
    let mut stack: Vec<NodeId> = Vec::new();
    let mut toplevel: Vec<NodeId> = Vec::new();

    for token in Tokenizer::new_with_emitter(src, OrderedEmitter::default()).infallible()
    {
        match token {
            ParseToken::StartTag {
                name,
                attrs,
                self_closing,
            } => {
                let tag = kstring(&name)?;
                let elt = dom.new_element(tag.clone());
                for (k, v) in attrs {
                    dom.set_attr(elt, kstring(&k)?, kstring(&v)?);
                }
                match stack.last() {
                    Some(top) => dom.append_child(*top, elt),
                    None => toplevel.push(elt),
                }
                if !(self_closing || is_void_tag(&tag)) {
                    stack.push(elt);
                }
            }
            ParseToken::EndTag { name } => {
                let name = kstring(&name)?;
                if is_void_tag(&name) {
                    // </br> and friends; nothing was pushed for them.
                    continue;
                }
                match stack
                    .iter()
                    .rposition(|id| dom.tag(*id).as_deref() == Some(name.as_str()))
                {
                    Some(pos) => {
                        if pos != stack.len() - 1 {
                            warn!("closing tag </{}> implicitly closes {} open \
                                   element(s)",
                                  name.as_str(), stack.len() - 1 - pos);
                        }
                        stack.truncate(pos);
                    }
                    None => {
                        warn!("ignoring unmatched closing tag </{}>", name.as_str());
                    }
                }
            }
            ParseToken::String(s) => {
                let text = kstring(&s)?;
                let node = dom.new_text(text);
                match stack.last() {
                    Some(top) => dom.append_child(*top, node),
                    None => toplevel.push(node),
                }
            }
            ParseToken::Comment(s) => {
                let text = kstring(&s)?;
                let node = dom.new_comment(text);
                match stack.last() {
                    Some(top) => dom.append_child(*top, node),
                    None => toplevel.push(node),
                }
            }
            ParseToken::Doctype => {
                // The canonical doctype is regenerated on dump.
            }
            ParseToken::Error(e) => {
                return Err(DomError::MalformedMarkup(format!("{e}")));
            }
        }
    }
    Ok(toplevel)
}

/// The collaborator interface of the markup normalizer: parse and
/// re-serialize, yielding the canonical fragment encoding.
pub fn normalize(src: &str) -> Result<String, DomError> {
    let mut dom = Dom::new();
    let nodes = parse_fragment(&mut dom, src)?;
    let mut v = Vec::new();
    for n in nodes {
        dom.print_html_fragment(n, &mut v)
            .expect("no I/O errors writing to Vec");
    }
    Ok(String::from_utf8(v).expect("serializer only emits UTF-8"))
}
