//! The directive attribute vocabulary: recognized names, the dispatch
//! priority, and parsers for the directive argument mini-syntaxes.
//!
//! At most one directive applies per node: the first recognized one in
//! priority order wins and any other directive-shaped attribute on the
//! same node is inert.

use std::collections::HashMap;

use anyhow::{Result, bail};
use kstring::KString;
use lazy_static::lazy_static;
use sdom::{Dom, NodeId};
use sutil::slice::first_and_rest;

pub const CODE: &str = "data-code";
pub const TEXT: &str = "data-text";
pub const IMAGE: &str = "data-image";
pub const IF: &str = "data-if";
pub const ELIF: &str = "data-elif";
pub const ELSE: &str = "data-else";
pub const SWITCH: &str = "data-switch";
pub const CASE: &str = "data-case";
pub const DEFAULT: &str = "data-default";
pub const FOR: &str = "data-for";
pub const WITH: &str = "data-with";
pub const INCLUDE: &str = "data-include";
pub const PAR: &str = "data-par";
pub const SET: &str = "data-set";
pub const DELETE: &str = "data-delete";
pub const REPLACE: &str = "data-replace";
pub const BEFORE: &str = "data-before";
pub const AFTER: &str = "data-after";
pub const PREPEND: &str = "data-prepend";
pub const APPEND: &str = "data-append";
pub const LOCK: &str = "data-lock";
pub const INCLUDED: &str = "data-included";
pub const INDEX: &str = "data-index";
pub const EXTRA: &str = "data-extra";
pub const OFF: &str = "data-off";
pub const ERROR: &str = "data-error";

lazy_static! {
    /// Read-only name-to-meaning table, for diagnostics.
    pub static ref DIRECTIVE_DESCRIPTIONS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(CODE, "execute element text in the context");
        m.insert(TEXT, "replace element text with an expression's value");
        m.insert(IMAGE, "media extension point");
        m.insert(IF, "conditional");
        m.insert(ELIF, "conditional alternative");
        m.insert(ELSE, "conditional fallback");
        m.insert(SWITCH, "multi-way branch");
        m.insert(CASE, "branch of a switch");
        m.insert(DEFAULT, "fallback branch of a switch");
        m.insert(FOR, "loop over a sequence");
        m.insert(WITH, "scope derived from an expression");
        m.insert(INCLUDE, "include another stencil's content");
        m.insert(PAR, "include parameter declaration");
        m.insert(SET, "include parameter supply");
        m.insert(LOCK, "exempt subtree from destructive re-render");
        m.insert(INCLUDED, "content generated by an include");
        m.insert(INDEX, "loop identity of a generated child");
        m.insert(EXTRA, "locked loop child beyond the current item count");
        m.insert(OFF, "inactive branch marker");
        m.insert(ERROR, "captured per-node failure");
        m
    };
}

/// The directive selected for a node, raw argument text included.
/// Argument parsing stays with the renderer so that a malformed spec
/// becomes a node-local error, not a skipped directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Code { lang: KString },
    Text { expr: KString },
    Image { expr: KString },
    If { expr: KString },
    Elif { expr: KString },
    Else,
    Switch { expr: KString },
    For { spec: KString },
    With { expr: KString },
    Include { spec: KString },
}

/// First match in this fixed priority order wins.
pub fn directive_of(dom: &Dom, id: NodeId) -> Option<Directive> {
    if !dom.is_element(id) {
        return None;
    }
    if dom.tag(id).as_deref() == Some("code") {
        if let Some(lang) = dom.attr(id, CODE) {
            return Some(Directive::Code { lang });
        }
    }
    if let Some(expr) = dom.attr(id, TEXT) {
        return Some(Directive::Text { expr });
    }
    if let Some(expr) = dom.attr(id, IMAGE) {
        return Some(Directive::Image { expr });
    }
    if let Some(expr) = dom.attr(id, IF) {
        return Some(Directive::If { expr });
    }
    if let Some(expr) = dom.attr(id, ELIF) {
        return Some(Directive::Elif { expr });
    }
    if dom.has_attr(id, ELSE) {
        return Some(Directive::Else);
    }
    if let Some(expr) = dom.attr(id, SWITCH) {
        return Some(Directive::Switch { expr });
    }
    if let Some(spec) = dom.attr(id, FOR) {
        return Some(Directive::For { spec });
    }
    if let Some(expr) = dom.attr(id, WITH) {
        return Some(Directive::With { expr });
    }
    if let Some(spec) = dom.attr(id, INCLUDE) {
        return Some(Directive::Include { spec });
    }
    None
}

/// `"item in items"`. The keyword form is the canonical one; nothing
/// else is accepted.
pub fn parse_for(spec: &str) -> Result<(String, String)> {
    if let Some((item, items)) = spec.split_once(" in ") {
        let item = item.trim();
        let items = items.trim();
        if item.is_empty() || items.is_empty() {
            bail!("malformed loop spec {spec:?}")
        }
        Ok((item.to_string(), items.to_string()))
    } else {
        bail!("malformed loop spec {spec:?}, expected \"item in items\"")
    }
}

/// `"locator [select <selector>]"`.
pub fn parse_include(spec: &str) -> Result<(String, Option<String>)> {
    let words: Vec<&str> = spec.split_whitespace().collect();
    let (locator, rest) = match first_and_rest(&words) {
        Some(x) => x,
        None => bail!("empty include spec"),
    };
    match first_and_rest(rest) {
        None => Ok((locator.to_string(), None)),
        Some((&"select", selector_words)) => {
            if selector_words.is_empty() {
                bail!("include spec {spec:?} has `select` without a selector")
            }
            Ok((locator.to_string(), Some(selector_words.join(" "))))
        }
        Some((word, _)) => {
            bail!("unexpected word {word:?} in include spec {spec:?}")
        }
    }
}

/// A declared include parameter: `"name [type T] [value default]"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Par {
    pub name: String,
    pub typ: Option<String>,
    pub default: Option<String>,
}

pub fn parse_par(spec: &str) -> Result<Par> {
    // The default is an expression and may contain spaces; split it off
    // first.
    let (head, default) = match spec.split_once(" value ") {
        Some((head, default)) => (head, Some(default.trim().to_string())),
        None => (spec, None),
    };
    let words: Vec<&str> = head.split_whitespace().collect();
    let (name, rest) = match first_and_rest(&words) {
        Some(x) => x,
        None => bail!("empty parameter spec"),
    };
    let typ = match rest {
        [] => None,
        ["type", t] => Some(t.to_string()),
        _ => bail!("malformed parameter spec {spec:?}"),
    };
    Ok(Par {
        name: name.to_string(),
        typ,
        default,
    })
}

/// `"name to expr"`.
pub fn parse_set(spec: &str) -> Result<(String, String)> {
    if let Some((name, expr)) = spec.split_once(" to ") {
        let name = name.trim();
        let expr = expr.trim();
        if name.is_empty() || expr.is_empty() {
            bail!("malformed set spec {spec:?}")
        }
        Ok((name.to_string(), expr.to_string()))
    } else {
        bail!("malformed set spec {spec:?}, expected \"name to expr\"")
    }
}

/// True if the node or any descendant carries the lock marker; such
/// subtrees are exempt from destructive re-render operations.
pub fn subtree_locked(dom: &Dom, id: NodeId) -> bool {
    dom.find_first(id, &|dom, n| dom.has_attr(n, LOCK)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_descriptions_cover_vocabulary() {
        for name in [
            CODE, TEXT, IMAGE, IF, ELIF, ELSE, SWITCH, CASE, DEFAULT, FOR,
            WITH, INCLUDE, PAR, SET, LOCK, INCLUDED, INDEX, EXTRA, OFF, ERROR,
        ] {
            assert!(DIRECTIVE_DESCRIPTIONS.contains_key(name), "{name}");
        }
    }

    #[test]
    fn t_priority() {
        let mut dom = Dom::new();
        let e = dom.new_element("div");
        dom.set_attr(e, IF, "x");
        dom.set_attr(e, TEXT, "y");
        // data-text outranks data-if; data-if is inert here.
        assert_eq!(
            directive_of(&dom, e),
            Some(Directive::Text { expr: KString::from_ref("y") })
        );
    }

    #[test]
    fn t_code_needs_lang() {
        let mut dom = Dom::new();
        let display = dom.new_element("code");
        assert_eq!(directive_of(&dom, display), None);
        let exec = dom.new_element("code");
        dom.set_attr(exec, CODE, "map");
        assert_eq!(
            directive_of(&dom, exec),
            Some(Directive::Code { lang: KString::from_ref("map") })
        );
    }

    #[test]
    fn t_parse_for() {
        assert_eq!(
            parse_for("item in items").unwrap(),
            ("item".to_string(), "items".to_string())
        );
        assert!(parse_for("item:items").is_err());
        assert!(parse_for("items").is_err());
        assert!(parse_for(" in items").is_err());
    }

    #[test]
    fn t_parse_include() {
        assert_eq!(
            parse_include("id://nav").unwrap(),
            ("id://nav".to_string(), None)
        );
        assert_eq!(
            parse_include("id://nav select #menu .item").unwrap(),
            ("id://nav".to_string(), Some("#menu .item".to_string()))
        );
        assert!(parse_include("").is_err());
        assert!(parse_include("id://nav pick #menu").is_err());
        assert!(parse_include("id://nav select").is_err());
    }

    #[test]
    fn t_parse_par() {
        assert_eq!(
            parse_par("caption").unwrap(),
            Par { name: "caption".into(), typ: None, default: None }
        );
        assert_eq!(
            parse_par("caption type text value \"a default\"").unwrap(),
            Par {
                name: "caption".into(),
                typ: Some("text".into()),
                default: Some("\"a default\"".into()),
            }
        );
        assert_eq!(
            parse_par("count value 3").unwrap(),
            Par { name: "count".into(), typ: None, default: Some("3".into()) }
        );
        assert!(parse_par("").is_err());
        assert!(parse_par("a b c").is_err());
    }

    #[test]
    fn t_parse_set() {
        assert_eq!(
            parse_set("caption to title").unwrap(),
            ("caption".to_string(), "title".to_string())
        );
        assert!(parse_set("caption").is_err());
    }
}
