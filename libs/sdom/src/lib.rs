//! Document tree abstraction for stencils: a mutable arena of nodes
//! addressed by stable `NodeId` handles. Parent and child links are
//! indices into the arena, so subtree moves and removals can never
//! produce dangling references; removed slots go onto a free list and
//! are reused.

pub mod myfrom;
pub mod parse;
pub mod selector;

use std::collections::HashSet;
use std::io::Write;

use anyhow::{Result, bail};
use kstring::KString;
use lazy_static::lazy_static;

pub use selector::Selector;

use crate::myfrom::MyFrom;

/// Errors a caller of the document layer has to distinguish; everything
/// else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum DomError {
    #[error("malformed markup: {0}")]
    MalformedMarkup(String),
    #[error("malformed selector {0:?}: {1}")]
    MalformedSelector(String, String),
}

pub const DOCTYPE: &str = "<!DOCTYPE html>\n";

lazy_static! {
    /// Elements serialized without a closing tag.
    static ref VOID_ELEMENTS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for t in ["area", "base", "br", "col", "embed", "hr", "img", "input",
                  "link", "meta", "param", "source", "track", "wbr"] {
            s.insert(t);
        }
        s
    };
}

pub fn is_void_tag(tag: &str) -> bool {
    VOID_ELEMENTS.contains(tag)
}

/// Handle into a `Dom` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: KString,
    // Insertion-ordered, keys unique (`set_attr` replaces in place).
    attrs: Vec<(KString, KString)>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Element(Element),
    Text(KString),
    Comment(KString),
}

#[derive(Debug)]
struct Slot {
    parent: Option<NodeId>,
    // None means vacant (on the free list).
    data: Option<NodeData>,
}

#[derive(Debug)]
pub struct Dom {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Dom {
    pub fn new() -> Self {
        Dom {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        if let Some(i) = self.free.pop() {
            let slot = &mut self.slots[i as usize];
            slot.parent = None;
            slot.data = Some(data);
            NodeId(i)
        } else {
            self.slots.push(Slot {
                parent: None,
                data: Some(data),
            });
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn slot(&self, id: NodeId) -> &Slot {
        let slot = self.slots.get(id.index()).expect("node id within arena");
        assert!(slot.data.is_some(), "node id should resolve, got vacant slot");
        slot
    }

    fn data(&self, id: NodeId) -> &NodeData {
        self.slot(id).data.as_ref().expect("checked in slot()")
    }

    fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        self.slots
            .get_mut(id.index())
            .expect("node id within arena")
            .data
            .as_mut()
            .expect("node id should resolve, got vacant slot")
    }

    pub fn new_element<T>(&mut self, tag: T) -> NodeId
    where KString: MyFrom<T>
    {
        self.alloc(NodeData::Element(Element {
            tag: KString::myfrom(tag),
            attrs: Vec::new(),
            children: Vec::new(),
        }))
    }

    pub fn new_text<T>(&mut self, text: T) -> NodeId
    where KString: MyFrom<T>
    {
        self.alloc(NodeData::Text(KString::myfrom(text)))
    }

    pub fn new_comment<T>(&mut self, text: T) -> NodeId
    where KString: MyFrom<T>
    {
        self.alloc(NodeData::Comment(KString::myfrom(text)))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).parent
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.data(id), NodeData::Element(_))
    }

    pub fn tag(&self, id: NodeId) -> Option<KString> {
        match self.data(id) {
            NodeData::Element(e) => Some(e.tag.clone()),
            _ => None,
        }
    }

    /// Children as an owned list, so callers may mutate the tree while
    /// walking it.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.data(id) {
            NodeData::Element(e) => e.children.clone(),
            _ => Vec::new(),
        }
    }

    pub fn child_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .into_iter()
            .filter(|c| self.is_element(*c))
            .collect()
    }

    pub fn first_child_element(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).into_iter().find(|c| self.is_element(*c))
    }

    pub fn attr(&self, id: NodeId, key: &str) -> Option<KString> {
        match self.data(id) {
            NodeData::Element(e) => e
                .attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn has_attr(&self, id: NodeId, key: &str) -> bool {
        self.attr(id, key).is_some()
    }

    pub fn attrs(&self, id: NodeId) -> Vec<(KString, KString)> {
        match self.data(id) {
            NodeData::Element(e) => e.attrs.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces the value in place if `key` is already present, keeping
    /// attribute order stable across re-renders.
    pub fn set_attr<K, V>(&mut self, id: NodeId, key: K, val: V)
    where KString: MyFrom<K> + MyFrom<V>
    {
        let key = KString::myfrom(key);
        let val = KString::myfrom(val);
        match self.data_mut(id) {
            NodeData::Element(e) => {
                if let Some(slot) = e.attrs.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = val;
                } else {
                    e.attrs.push((key, val));
                }
            }
            _ => panic!("set_attr on non-element node"),
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, key: &str) {
        if let NodeData::Element(e) = self.data_mut(id) {
            e.attrs.retain(|(k, _)| k != key);
        }
    }

    pub fn text(&self, id: NodeId) -> Option<KString> {
        match self.data(id) {
            NodeData::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Concatenated text of the node and all its descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        match self.data(id) {
            NodeData::Text(s) => out.push_str(s.as_str()),
            NodeData::Element(e) => {
                for c in e.children.clone() {
                    self.collect_text(c, out);
                }
            }
            NodeData::Comment(_) => (),
        }
    }

    /// Replace all children with a single text node.
    pub fn set_text<T>(&mut self, id: NodeId, text: T)
    where KString: MyFrom<T>
    {
        for c in self.children(id) {
            self.remove(c);
        }
        let t = self.new_text(text);
        self.append_child(id, t);
    }

    pub fn position_of(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        match self.data(parent) {
            NodeData::Element(e) => e.children.iter().position(|c| *c == child),
            _ => None,
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        let n = self.children(parent).len();
        self.insert_child(parent, n, child);
    }

    pub fn insert_child(&mut self, parent: NodeId, position: usize, child: NodeId) {
        assert!(
            self.slot(child).parent.is_none(),
            "child must be detached before insertion"
        );
        match self.data_mut(parent) {
            NodeData::Element(e) => {
                let position = position.min(e.children.len());
                e.children.insert(position, child);
            }
            _ => panic!("insert_child on non-element node"),
        }
        self.slots[child.index()].parent = Some(parent);
    }

    /// Unlink `id` from its parent without freeing it.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.slot(id).parent {
            if let NodeData::Element(e) = self.data_mut(parent) {
                e.children.retain(|c| *c != id);
            }
            self.slots[id.index()].parent = None;
        }
    }

    /// Detach `id` and free its whole subtree. Any retained `NodeId`
    /// into the subtree is invalid afterwards.
    pub fn remove(&mut self, id: NodeId) {
        self.detach(id);
        self.free_subtree(id);
    }

    fn free_subtree(&mut self, id: NodeId) {
        for c in self.children(id) {
            self.free_subtree(c);
        }
        let slot = &mut self.slots[id.index()];
        slot.data = None;
        slot.parent = None;
        self.free.push(id.0);
    }

    /// Deep copy of a subtree; the copy is detached.
    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let data = self.data(id).clone();
        match data {
            NodeData::Element(e) => {
                let copy = self.alloc(NodeData::Element(Element {
                    tag: e.tag,
                    attrs: e.attrs,
                    children: Vec::new(),
                }));
                for c in e.children {
                    let cc = self.deep_clone(c);
                    self.append_child(copy, cc);
                }
                copy
            }
            other => self.alloc(other),
        }
    }

    /// Deep copy of a subtree living in another arena; the copy is
    /// detached in `self`.
    pub fn import_subtree(&mut self, src: &Dom, id: NodeId) -> NodeId {
        match src.data(id) {
            NodeData::Element(e) => {
                let e = e.clone();
                let copy = self.alloc(NodeData::Element(Element {
                    tag: e.tag,
                    attrs: e.attrs,
                    children: Vec::new(),
                }));
                for c in e.children {
                    let cc = self.import_subtree(src, c);
                    self.append_child(copy, cc);
                }
                copy
            }
            other => self.alloc(other.clone()),
        }
    }

    /// First node in the subtree (preorder, `root` included) for which
    /// `pred` returns true.
    pub fn find_first<F: Fn(&Dom, NodeId) -> bool>(
        &self,
        root: NodeId,
        pred: &F,
    ) -> Option<NodeId> {
        if pred(self, root) {
            return Some(root);
        }
        for c in self.children(root) {
            if let Some(hit) = self.find_first(c, pred) {
                return Some(hit);
            }
        }
        None
    }

    pub fn find_all<F: Fn(&Dom, NodeId) -> bool>(
        &self,
        root: NodeId,
        pred: &F,
    ) -> Vec<NodeId> {
        let mut hits = Vec::new();
        self.find_all_into(root, pred, &mut hits);
        hits
    }

    fn find_all_into<F: Fn(&Dom, NodeId) -> bool>(
        &self,
        root: NodeId,
        pred: &F,
        hits: &mut Vec<NodeId>,
    ) {
        if pred(self, root) {
            hits.push(root);
        }
        for c in self.children(root) {
            self.find_all_into(c, pred, hits);
        }
    }
}

// Serialization, kept close to the shape the documents were loaded
// from: elements with escaped attribute values and text, comments
// verbatim, void elements without closing tag.

pub fn html_escape(out: &mut Vec<u8>, bytes: &[u8]) {
    for b in bytes {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'\'' => out.extend_from_slice(b"&#39;"),
            _ => out.push(*b),
        }
    }
}

impl Dom {
    pub fn print_html_fragment(&self, id: NodeId, out: &mut impl Write) -> Result<()> {
        match self.data(id) {
            NodeData::Text(s) => {
                let mut buf = Vec::new();
                html_escape(&mut buf, s.as_bytes());
                out.write_all(&buf)?;
            }
            NodeData::Comment(s) => {
                out.write_all(b"<!--")?;
                out.write_all(s.as_bytes())?;
                out.write_all(b"-->")?;
            }
            NodeData::Element(e) => {
                out.write_all(b"<")?;
                out.write_all(e.tag.as_bytes())?;
                for (k, v) in &e.attrs {
                    out.write_all(b" ")?;
                    out.write_all(k.as_bytes())?;
                    out.write_all(b"=\"")?;
                    let mut buf = Vec::new();
                    html_escape(&mut buf, v.as_bytes());
                    out.write_all(&buf)?;
                    out.write_all(b"\"")?;
                }
                out.write_all(b">")?;
                if !is_void_tag(&e.tag) {
                    for c in &e.children {
                        self.print_html_fragment(*c, out)?;
                    }
                    out.write_all(b"</")?;
                    out.write_all(e.tag.as_bytes())?;
                    out.write_all(b">")?;
                } else if !e.children.is_empty() {
                    bail!("void element <{}> has children", e.tag)
                }
            }
        }
        Ok(())
    }

    pub fn to_html_string(&self, id: NodeId, want_doctype: bool) -> String {
        let mut v = Vec::new();
        if want_doctype {
            v.extend_from_slice(DOCTYPE.as_bytes());
        }
        self.print_html_fragment(id, &mut v)
            .expect("no I/O errors writing to Vec");
        String::from_utf8(v).expect("serializer only emits UTF-8")
    }

    /// Serialized children, without the node's own tag.
    pub fn inner_html(&self, id: NodeId) -> String {
        let mut v = Vec::new();
        for c in self.children(id) {
            self.print_html_fragment(c, &mut v)
                .expect("no I/O errors writing to Vec");
        }
        String::from_utf8(v).expect("serializer only emits UTF-8")
    }
}
