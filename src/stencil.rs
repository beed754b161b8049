//! The top-level document abstraction: owns one document tree, exposes
//! content accessors and the `render(context)` entry point.
//!
//! A stencil's markup is polyglot (valid as HTML and as XML); the
//! document head is not preserved verbatim but regenerated canonically
//! on dump from the extracted metadata.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context as _, Result, anyhow};
use itertools::Itertools;
use kstring::KString;
use sdom::parse::parse_fragment;
use sdom::{Dom, NodeId};

use crate::context::Context;
use crate::directive;
use crate::error::StencilError;
use crate::registry;
use crate::render::Renderer;

#[derive(Debug)]
pub struct Stencil {
    dom: Dom,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    pub id: Option<KString>,
    pub title: Option<KString>,
    pub description: Option<KString>,
    pub keywords: Vec<KString>,
    pub authors: Vec<KString>,
    /// Which kinds of embedded code the document uses. Informational.
    pub languages: BTreeSet<KString>,
}

fn all_whitespace(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_whitespace())
}

impl Stencil {
    /// The minimal polyglot-markup skeleton.
    pub fn from_scratch() -> Stencil {
        let mut dom = Dom::new();
        let root = dom.new_element("html");
        let head = dom.new_element("head");
        let body = dom.new_element("body");
        dom.append_child(root, head);
        dom.append_child(root, body);
        Stencil {
            dom,
            root,
            head,
            body,
            id: None,
            title: None,
            description: None,
            keywords: Vec::new(),
            authors: Vec::new(),
            languages: BTreeSet::new(),
        }
    }

    /// Dispatch on the locator's scheme prefix.
    pub fn from(locator: &str) -> Result<Stencil> {
        let (scheme, rest) = locator
            .split_once("://")
            .ok_or_else(|| StencilError::UnrecognizedScheme(locator.to_string()))?;
        match scheme {
            "html" => Ok(Self::from_markup(rest)?),
            "file" => Self::read(rest),
            "id" => registry::load(rest),
            _ => Err(StencilError::UnrecognizedScheme(locator.to_string()).into()),
        }
    }

    /// Load from raw markup: normalize, pull the recognized `<meta>`
    /// entries into document attributes, discard the rest of the head
    /// (it is regenerated on dump) and keep everything else as body
    /// content.
    pub fn from_markup(src: &str) -> Result<Stencil, sdom::DomError> {
        let mut st = Stencil::from_scratch();
        let nodes = parse_fragment(&mut st.dom, src)?;
        for node in nodes {
            st.place_toplevel(node);
        }
        st.scan_languages();
        Ok(st)
    }

    fn place_toplevel(&mut self, node: NodeId) {
        match self.dom.tag(node).as_deref() {
            Some("html") => {
                for c in self.dom.children(node) {
                    self.dom.detach(c);
                    self.place_toplevel(c);
                }
                self.dom.remove(node);
            }
            Some("head") => {
                self.extract_head(node);
                self.dom.remove(node);
            }
            Some("body") => {
                for c in self.dom.children(node) {
                    self.dom.detach(c);
                    self.dom.append_child(self.body, c);
                }
                self.dom.remove(node);
            }
            _ => {
                // Bare whitespace between the document-level elements
                // is layout, not content.
                if let Some(text) = self.dom.text(node) {
                    if all_whitespace(&text) {
                        self.dom.remove(node);
                        return;
                    }
                }
                self.dom.append_child(self.body, node);
            }
        }
    }

    fn extract_head(&mut self, head: NodeId) {
        for n in self.dom.find_all(head, &|dom, n| dom.is_element(n)) {
            match self.dom.tag(n).as_deref() {
                Some("title") => {
                    self.title = Some(KString::from_string(self.dom.text_content(n)));
                }
                Some("meta") => {
                    let name = self.dom.attr(n, "name");
                    let content = self
                        .dom
                        .attr(n, "content")
                        .unwrap_or_else(|| KString::from_static(""));
                    match name.as_deref() {
                        Some("id") => self.id = Some(content),
                        Some("description") => self.description = Some(content),
                        Some("keywords") => {
                            self.keywords = content
                                .split(',')
                                .map(|k| KString::from_ref(k.trim()))
                                .filter(|k| !k.is_empty())
                                .collect();
                        }
                        Some("author") => self.authors.push(content),
                        _ => (),
                    }
                }
                _ => (),
            }
        }
    }

    fn scan_languages(&mut self) {
        self.languages = self
            .dom
            .find_all(self.body, &|dom, n| {
                dom.tag(n).as_deref() == Some("code") && dom.has_attr(n, directive::CODE)
            })
            .into_iter()
            .filter_map(|n| self.dom.attr(n, directive::CODE))
            .collect();
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut Dom {
        &mut self.dom
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// The body's serialized form in the given surface syntax. Only
    /// `"html"` is supported by this build.
    pub fn content(&self, language: &str) -> Result<String, StencilError> {
        match language {
            "html" => Ok(self.dom.inner_html(self.body)),
            other => Err(StencilError::NotImplemented(other.to_string())),
        }
    }

    /// Replace the body from its serialized form.
    pub fn set_content(&mut self, text: &str, language: &str) -> Result<()> {
        match language {
            "html" => {
                for c in self.dom.children(self.body) {
                    self.dom.remove(c);
                }
                let nodes = parse_fragment(&mut self.dom, text)?;
                for n in nodes {
                    self.dom.append_child(self.body, n);
                }
                self.scan_languages();
                Ok(())
            }
            other => Err(StencilError::NotImplemented(other.to_string()).into()),
        }
    }

    /// Serialize the whole document, with the canonical head rebuilt
    /// from the document attributes.
    pub fn dump(&mut self) -> String {
        self.regenerate_head();
        self.dom.to_html_string(self.root, true)
    }

    fn regenerate_head(&mut self) {
        for c in self.dom.children(self.head) {
            self.dom.remove(c);
        }
        if let Some(title) = &self.title {
            let t = self.dom.new_element("title");
            self.dom.set_text(t, title.clone());
            self.dom.append_child(self.head, t);
        }
        let meta = |dom: &mut Dom, head: NodeId, name: &str, content: KString| {
            let m = dom.new_element("meta");
            dom.set_attr(m, "name", name);
            dom.set_attr(m, "content", content);
            dom.append_child(head, m);
        };
        if let Some(id) = self.id.clone() {
            meta(&mut self.dom, self.head, "id", id);
        }
        if !self.keywords.is_empty() {
            let joined = self.keywords.iter().map(|k| k.as_str()).join(", ");
            meta(&mut self.dom, self.head, "keywords", KString::from_string(joined));
        }
        if let Some(description) = self.description.clone() {
            meta(&mut self.dom, self.head, "description", description);
        }
        for author in self.authors.clone() {
            meta(&mut self.dom, self.head, "author", author);
        }
    }

    /// Render the body subtree against an execution context. Node-level
    /// failures are captured in the tree as `data-error` attributes and
    /// never reach the caller.
    pub fn render<C: Context>(&mut self, cx: &mut C) {
        let mut renderer = Renderer::new(cx);
        renderer.render_node(&mut self.dom, self.body);
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Stencil> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path)
            .with_context(|| anyhow!("reading stencil from {path:?}"))?;
        Ok(Self::from_markup(&src)?)
    }

    pub fn write<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.dump())
            .with_context(|| anyhow!("writing stencil to {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MapContext;

    #[test]
    fn t_from_scratch_dump() {
        let mut st = Stencil::from_scratch();
        assert_eq!(
            st.dump(),
            "<!DOCTYPE html>\n<html><head></head><body></body></html>"
        );
    }

    #[test]
    fn t_debug_format() {
        let st = Stencil::from_scratch();
        assert!(format!("{st:?}").starts_with("Stencil"));
    }

    #[test]
    fn t_from_markup_meta() {
        let st = Stencil::from_markup(
            "<html><head>\
             <title>A title</title>\
             <meta name=\"id\" content=\"doc-1\">\
             <meta name=\"keywords\" content=\"alpha, beta , \">\
             <meta name=\"description\" content=\"about\">\
             <link rel=\"stylesheet\" href=\"ignored.css\">\
             </head><body><p>x</p></body></html>",
        )
        .unwrap();
        assert_eq!(st.id.as_deref(), Some("doc-1"));
        assert_eq!(st.title.as_deref(), Some("A title"));
        assert_eq!(st.description.as_deref(), Some("about"));
        assert_eq!(
            st.keywords.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
        assert_eq!(st.content("html").unwrap(), "<p>x</p>");
    }

    #[test]
    fn t_head_regenerated() {
        let mut st = Stencil::from_markup(
            "<html><head><meta name=\"id\" content=\"doc-2\">\
             <script src=\"dropped.js\"></script></head>\
             <body><p>x</p></body></html>",
        )
        .unwrap();
        assert_eq!(
            st.dump(),
            "<!DOCTYPE html>\n<html><head>\
             <meta name=\"id\" content=\"doc-2\">\
             </head><body><p>x</p></body></html>"
        );
    }

    #[test]
    fn t_fragment_becomes_body() {
        let st = Stencil::from_markup("hello <b>world</b>").unwrap();
        assert_eq!(st.content("html").unwrap(), "hello <b>world</b>");
    }

    #[test]
    fn t_content_language() {
        let st = Stencil::from_scratch();
        let e = st.content("sexpr").unwrap_err();
        assert_eq!(e.to_string(), "content language \"sexpr\" is not implemented");
    }

    #[test]
    fn t_set_content() {
        let mut st = Stencil::from_scratch();
        st.set_content("<p data-text=\"x\"></p>", "html").unwrap();
        assert_eq!(st.content("html").unwrap(), "<p data-text=\"x\"></p>");
        assert!(st.set_content("(p)", "sexpr").is_err());
    }

    #[test]
    fn t_from_scheme_dispatch() {
        let st = Stencil::from("html://<p>inline</p>").unwrap();
        assert_eq!(st.content("html").unwrap(), "<p>inline</p>");

        let e = Stencil::from("no-separator").unwrap_err();
        assert_eq!(
            e.to_string(),
            "unrecognized source locator scheme in \"no-separator\""
        );
        let e = Stencil::from("gopher://x").unwrap_err();
        assert_eq!(
            e.to_string(),
            "unrecognized source locator scheme in \"gopher://x\""
        );
    }

    #[test]
    fn t_languages_scanned() {
        let st = Stencil::from_markup(
            "<code data-code=\"map\">a = 1</code><code>display only</code>",
        )
        .unwrap();
        assert_eq!(
            st.languages.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
            vec!["map"]
        );
    }

    #[test]
    fn t_render_entry() {
        let mut st = Stencil::from_markup("<p data-text=\"greeting\"></p>").unwrap();
        let mut cx = MapContext::new();
        cx.define("greeting", "hi");
        st.render(&mut cx);
        assert_eq!(st.content("html").unwrap(), "<p data-text=\"greeting\">hi</p>");
    }
}
