//! Include resolution: pull content from another stencil into the
//! including node, adapt it through modifier children, bind declared
//! parameters and render the result in place.
//!
//! Includes are refreshing: previously included content (tagged
//! `data-included`) is dropped and rebuilt on every render, except
//! where a lock marker protects it.

use anyhow::{Result, anyhow, bail};
use kstring::KString;
use sdom::{Dom, NodeId};
use sutil::warn;

use crate::context::Context;
use crate::directive::{self, parse_include, parse_par, parse_set};
use crate::error::MissingParameter;
use crate::render::{MAX_INCLUDE_DEPTH, Renderer};
use crate::stencil::Stencil;

/// A modifier child of an include node rewrites the fetched content
/// before it is spliced in. First match only; the consumed selector
/// attribute is stripped from the inserted copy.
enum Modifier {
    Delete,
    Replace,
    Before,
    After,
    Prepend,
    Append,
}

fn modifier_of(dom: &Dom, id: NodeId) -> Option<(Modifier, KString, &'static str)> {
    for (kind, key) in [
        (Modifier::Delete, directive::DELETE),
        (Modifier::Replace, directive::REPLACE),
        (Modifier::Before, directive::BEFORE),
        (Modifier::After, directive::AFTER),
        (Modifier::Prepend, directive::PREPEND),
        (Modifier::Append, directive::APPEND),
    ] {
        if let Some(selector) = dom.attr(id, key) {
            return Some((kind, selector, key));
        }
    }
    None
}

fn all_whitespace(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_whitespace())
}

pub fn render_include<C: Context>(
    r: &mut Renderer<C>,
    dom: &mut Dom,
    id: NodeId,
    spec: &str,
) -> Result<()> {
    if r.include_depth >= MAX_INCLUDE_DEPTH {
        bail!("include nesting deeper than {MAX_INCLUDE_DEPTH}, cycle suspected");
    }
    let (locator, selector) = parse_include(spec)?;

    // Refresh: drop the previous include's output, keep locked parts.
    for child in dom.child_elements(id) {
        if dom.has_attr(child, directive::INCLUDED)
            && !directive::subtree_locked(dom, child)
        {
            dom.remove(child);
        }
    }

    let target = Stencil::from(&locator)?;
    let selected = match &selector {
        Some(sel) => target.dom().resolve(target.body(), sel)?,
        None => target.dom().children(target.body()),
    };

    // Stage the fetched content in a detached sink so modifiers can
    // rewrite it without touching the live document.
    let sink = dom.new_element("div");
    for n in selected {
        let copy = dom.import_subtree(target.dom(), n);
        dom.append_child(sink, copy);
    }

    apply_modifiers(dom, id, sink);
    splice(dom, id, sink);
    dom.remove(sink);

    let scoped = bind_parameters(r, dom, id)?;
    r.include_depth += 1;
    r.render_children(dom, id);
    r.include_depth -= 1;
    if scoped {
        r.cx.exit()?;
    }
    Ok(())
}

fn apply_modifiers(dom: &mut Dom, id: NodeId, sink: NodeId) {
    for m in dom.child_elements(id) {
        if dom.has_attr(m, directive::INCLUDED) {
            continue;
        }
        let (kind, selector, key) = match modifier_of(dom, m) {
            Some(x) => x,
            None => continue,
        };
        let hit = match dom.resolve_first(sink, &selector) {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                warn!("include modifier selector {:?} matched nothing", selector);
                continue;
            }
            Err(e) => {
                warn!("include modifier skipped: {}", e);
                continue;
            }
        };
        match kind {
            Modifier::Delete => {
                dom.remove(hit);
            }
            Modifier::Replace => {
                let copy = modifier_copy(dom, m, key);
                let parent = dom.parent(hit).expect("hit is under the sink");
                let pos = dom.position_of(parent, hit).expect("hit is a child");
                dom.insert_child(parent, pos, copy);
                dom.remove(hit);
            }
            Modifier::Before => {
                let copy = modifier_copy(dom, m, key);
                let parent = dom.parent(hit).expect("hit is under the sink");
                let pos = dom.position_of(parent, hit).expect("hit is a child");
                dom.insert_child(parent, pos, copy);
            }
            Modifier::After => {
                let copy = modifier_copy(dom, m, key);
                let parent = dom.parent(hit).expect("hit is under the sink");
                let pos = dom.position_of(parent, hit).expect("hit is a child");
                dom.insert_child(parent, pos + 1, copy);
            }
            Modifier::Prepend => {
                let copy = modifier_copy(dom, m, key);
                dom.insert_child(hit, 0, copy);
            }
            Modifier::Append => {
                let copy = modifier_copy(dom, m, key);
                dom.append_child(hit, copy);
            }
        }
    }
}

fn modifier_copy(dom: &mut Dom, m: NodeId, key: &str) -> NodeId {
    let copy = dom.deep_clone(m);
    dom.remove_attr(copy, key);
    copy
}

/// Move the sink's children under the include node, each tagged as
/// included content. Stray text is wrapped so it can carry the tag;
/// pure-whitespace text is layout and gets dropped.
fn splice(dom: &mut Dom, id: NodeId, sink: NodeId) {
    for n in dom.children(sink) {
        dom.detach(n);
        if dom.is_element(n) {
            dom.set_attr(n, directive::INCLUDED, "true");
            dom.append_child(id, n);
        } else if let Some(text) = dom.text(n) {
            if all_whitespace(&text) {
                dom.remove(n);
            } else {
                let span = dom.new_element("span");
                dom.set_attr(span, directive::INCLUDED, "true");
                dom.append_child(span, n);
                dom.append_child(id, span);
            }
        } else {
            dom.append_child(id, n);
        }
    }
}

/// Collect `data-par` declarations from the included content and
/// `data-set` supplies from the include node's own children, bind them
/// in a fresh scope. Returns whether a scope was opened (the caller
/// exits it after rendering).
fn bind_parameters<C: Context>(
    r: &mut Renderer<C>,
    dom: &mut Dom,
    id: NodeId,
) -> Result<bool> {
    let pars: Vec<NodeId> = dom
        .children(id)
        .into_iter()
        .filter(|c| dom.has_attr(*c, directive::INCLUDED))
        .flat_map(|c| dom.find_all(c, &|dom, n| dom.has_attr(n, directive::PAR)))
        .collect();
    if pars.is_empty() {
        return Ok(false);
    }

    let mut sets: Vec<(String, String)> = Vec::new();
    for c in dom.child_elements(id) {
        if dom.has_attr(c, directive::INCLUDED) {
            continue;
        }
        if let Some(spec) = dom.attr(c, directive::SET) {
            sets.push(parse_set(&spec)?);
        }
    }

    r.cx.enter(None)?;
    for p in &pars {
        let spec = dom
            .attr(*p, directive::PAR)
            .ok_or_else(|| anyhow!("parameter declaration vanished"))?;
        let par = match parse_par(&spec) {
            Ok(par) => par,
            Err(e) => {
                r.cx.exit()?;
                return Err(e);
            }
        };
        let supplied = sets.iter().find(|(name, _)| *name == par.name);
        let expr = match (supplied, &par.default) {
            (Some((_, expr)), _) => expr.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => {
                r.cx.exit()?;
                return Err(MissingParameter(par.name).into());
            }
        };
        if let Err(e) = r.cx.assign(&par.name, &expr) {
            r.cx.exit()?;
            return Err(e);
        }
    }
    // Declarations are metadata, not content.
    for p in pars {
        dom.remove(p);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use crate::context::MapContext;
    use crate::registry;
    use crate::stencil::Stencil;

    fn body(st: &Stencil) -> String {
        st.content("html").unwrap()
    }

    #[test]
    fn t_include_inline() {
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"html://<p>shared</p>\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"html://&lt;p&gt;shared&lt;/p&gt;\">\
             <p data-included=\"true\">shared</p></div>"
        );
    }

    #[test]
    fn t_include_refresh_no_duplication() {
        registry::register("t-inc-nav", "<ul id=\"menu\"><li>home</li></ul>");
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-nav select #menu\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        let once = body(&st);
        assert_eq!(
            once,
            "<div data-include=\"id://t-inc-nav select #menu\">\
             <ul id=\"menu\" data-included=\"true\"><li>home</li></ul></div>"
        );
        st.render(&mut cx);
        assert_eq!(body(&st), once);
        registry::unregister("t-inc-nav");
    }

    #[test]
    fn t_include_select_subset() {
        registry::register(
            "t-inc-sel",
            "<h1>skip</h1><p class=\"pick\">a</p><p class=\"pick\">b</p>",
        );
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-sel select .pick\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-sel select .pick\">\
             <p class=\"pick\" data-included=\"true\">a</p>\
             <p class=\"pick\" data-included=\"true\">b</p></div>"
        );
        registry::unregister("t-inc-sel");
    }

    #[test]
    fn t_include_unknown_id_contained() {
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-nowhere\"></div><p>after</p>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-nowhere\" \
             data-error=\"no stencil registered under id &quot;t-inc-nowhere&quot;\">\
             </div><p>after</p>"
        );
    }

    #[test]
    fn t_include_modifiers() {
        registry::register(
            "t-inc-mod",
            "<ul id=\"menu\"><li id=\"a\">a</li><li id=\"b\">b</li></ul>",
        );
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-mod\">\
             <li data-replace=\"#a\" id=\"a2\">A</li>\
             <li data-delete=\"#b\"></li>\
             <li data-append=\"#menu\" id=\"z\">z</li>\
             </div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-mod\">\
             <li data-replace=\"#a\" id=\"a2\">A</li>\
             <li data-delete=\"#b\"></li>\
             <li data-append=\"#menu\" id=\"z\">z</li>\
             <ul id=\"menu\" data-included=\"true\">\
             <li id=\"a2\">A</li>\
             <li id=\"z\">z</li>\
             </ul></div>"
        );
        registry::unregister("t-inc-mod");
    }

    #[test]
    fn t_include_parameters() {
        registry::register(
            "t-inc-par",
            "<p data-par=\"caption\"></p><h2 data-text=\"caption\"></h2>",
        );
        let mut cx = MapContext::new();
        cx.define("title", "News");
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-par\">\
             <span data-set=\"caption to title\"></span>\
             </div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-par\">\
             <span data-set=\"caption to title\"></span>\
             <h2 data-text=\"caption\" data-included=\"true\">News</h2></div>"
        );
        registry::unregister("t-inc-par");
    }

    #[test]
    fn t_include_parameter_default() {
        registry::register(
            "t-inc-def",
            "<p data-par=\"caption value &quot;Untitled&quot;\"></p>\
             <h2 data-text=\"caption\"></h2>",
        );
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-def\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-def\">\
             <h2 data-text=\"caption\" data-included=\"true\">Untitled</h2></div>"
        );
        registry::unregister("t-inc-def");
    }

    #[test]
    fn t_include_missing_parameter() {
        registry::register(
            "t-inc-req",
            "<p data-par=\"caption\"></p><h2 data-text=\"caption\"></h2>",
        );
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-req\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert!(body(&st).contains(
            "data-error=\"missing required parameter &quot;caption&quot;\""
        ));
        registry::unregister("t-inc-req");
    }

    #[test]
    fn t_include_locked_content_survives() {
        registry::register("t-inc-lock", "<p id=\"note\">original</p>");
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-lock\"></div>",
        )
        .unwrap();
        st.render(&mut cx);

        // Hand-edit the included paragraph and lock it.
        {
            let p = st
                .dom()
                .resolve_first(st.body(), "#note")
                .unwrap()
                .unwrap();
            let dom = st.dom_mut();
            dom.set_text(p, "edited by hand");
            dom.set_attr(p, "data-lock", "true");
        }
        st.render(&mut cx);
        // The locked copy stays; the refresh adds a fresh copy too.
        let out = body(&st);
        assert!(out.contains("edited by hand"));
        assert!(out.contains(">original</p>"));
        registry::unregister("t-inc-lock");
    }

    #[test]
    fn t_include_cycle_bounded() {
        registry::register(
            "t-inc-cycle",
            "<div data-include=\"id://t-inc-cycle\"></div>",
        );
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-cycle\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert!(body(&st).contains("cycle suspected"));
        registry::unregister("t-inc-cycle");
    }

    #[test]
    fn t_include_text_wrapped() {
        registry::register("t-inc-text", "just words<p>and a block</p>");
        let mut cx = MapContext::new();
        let mut st = Stencil::from_markup(
            "<div data-include=\"id://t-inc-text\"></div>",
        )
        .unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-include=\"id://t-inc-text\">\
             <span data-included=\"true\">just words</span>\
             <p data-included=\"true\">and a block</p></div>"
        );
        registry::unregister("t-inc-text");
    }
}
