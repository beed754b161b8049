//! A small CSS selector subset, enough for stencil content selection:
//! `tag`, `#id`, `.class`, `[attr]`, `[attr=value]`, compounds thereof
//! and the descendant combinator (whitespace).

use kstring::KString;

use crate::{Dom, DomError, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    tag: Option<KString>,
    id: Option<KString>,
    classes: Vec<KString>,
    // None means presence check only.
    attrs: Vec<(KString, Option<KString>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    // Descendant chain, outermost first.
    steps: Vec<Compound>,
}

fn err(selector: &str, message: impl Into<String>) -> DomError {
    DomError::MalformedSelector(selector.to_string(), message.into())
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(s: &str, pos: usize) -> (usize, &str) {
    let rest = &s[pos..];
    let len = rest
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    (pos + len, &rest[..len])
}

fn parse_compound(selector: &str, part: &str) -> Result<Compound, DomError> {
    let mut compound = Compound {
        tag: None,
        id: None,
        classes: Vec::new(),
        attrs: Vec::new(),
    };
    let mut pos = 0;
    if part.starts_with(|c| is_ident_char(c)) {
        let (next, tag) = take_ident(part, 0);
        compound.tag = Some(KString::from_ref(tag));
        pos = next;
    }
    while pos < part.len() {
        let c = part[pos..].chars().next().expect("pos < len");
        match c {
            '#' => {
                let (next, name) = take_ident(part, pos + 1);
                if name.is_empty() {
                    return Err(err(selector, "empty id after '#'"));
                }
                compound.id = Some(KString::from_ref(name));
                pos = next;
            }
            '.' => {
                let (next, name) = take_ident(part, pos + 1);
                if name.is_empty() {
                    return Err(err(selector, "empty class after '.'"));
                }
                compound.classes.push(KString::from_ref(name));
                pos = next;
            }
            '[' => {
                let close = part[pos..]
                    .find(']')
                    .ok_or_else(|| err(selector, "missing ']'"))?
                    + pos;
                let inner = &part[pos + 1..close];
                let (key, val) = match inner.split_once('=') {
                    Some((k, v)) => {
                        let v = v.trim_matches('"').trim_matches('\'');
                        (k, Some(KString::from_ref(v)))
                    }
                    None => (inner, None),
                };
                if key.is_empty() {
                    return Err(err(selector, "empty attribute name"));
                }
                compound.attrs.push((KString::from_ref(key), val));
                pos = close + 1;
            }
            _ => {
                return Err(err(selector, format!("unexpected character {c:?}")));
            }
        }
    }
    if compound.tag.is_none()
        && compound.id.is_none()
        && compound.classes.is_empty()
        && compound.attrs.is_empty()
    {
        return Err(err(selector, "empty compound selector"));
    }
    Ok(compound)
}

impl Selector {
    pub fn parse(selector: &str) -> Result<Selector, DomError> {
        let steps = selector
            .split_whitespace()
            .map(|part| parse_compound(selector, part))
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(err(selector, "empty selector"));
        }
        Ok(Selector { steps })
    }

    pub fn matches(&self, dom: &Dom, id: NodeId) -> bool {
        matches_steps(dom, id, &self.steps)
    }
}

fn matches_steps(dom: &Dom, id: NodeId, steps: &[Compound]) -> bool {
    let (last, init) = match steps.split_last() {
        Some(x) => x,
        None => return false,
    };
    if !matches_compound(dom, id, last) {
        return false;
    }
    if init.is_empty() {
        return true;
    }
    // Any proper ancestor has to match the rest of the chain.
    let mut up = dom.parent(id);
    while let Some(ancestor) = up {
        if matches_steps(dom, ancestor, init) {
            return true;
        }
        up = dom.parent(ancestor);
    }
    false
}

fn matches_compound(dom: &Dom, id: NodeId, compound: &Compound) -> bool {
    if !dom.is_element(id) {
        return false;
    }
    if let Some(tag) = &compound.tag {
        if dom.tag(id).as_deref() != Some(tag.as_str()) {
            return false;
        }
    }
    if let Some(want) = &compound.id {
        if dom.attr(id, "id").as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if !compound.classes.is_empty() {
        let class = dom
            .attr(id, "class")
            .unwrap_or_else(|| KString::from_static(""));
        let have: Vec<&str> = class.split_ascii_whitespace().collect();
        for want in &compound.classes {
            if !have.contains(&want.as_str()) {
                return false;
            }
        }
    }
    for (key, want) in &compound.attrs {
        match (dom.attr(id, key), want) {
            (None, _) => return false,
            (Some(_), None) => (),
            (Some(v), Some(want)) => {
                if v != *want {
                    return false;
                }
            }
        }
    }
    true
}

impl Dom {
    /// Resolve a selector against the subtree under (and including)
    /// `root`, in document order.
    pub fn resolve(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>, DomError> {
        let sel = Selector::parse(selector)?;
        Ok(self.find_all(root, &|dom, id| sel.matches(dom, id)))
    }

    pub fn resolve_first(
        &self,
        root: NodeId,
        selector: &str,
    ) -> Result<Option<NodeId>, DomError> {
        let sel = Selector::parse(selector)?;
        Ok(self.find_first(root, &|dom, id| sel.matches(dom, id)))
    }
}
