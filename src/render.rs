//! The renderer: a pre-order, depth-first, single-threaded walk over
//! the document tree. Per node, the first recognized directive (in
//! priority order) decides whether and how children are visited; every
//! directive dispatch is a blocking call into the execution context.
//!
//! Failures are contained per node: the failing node gets a
//! `data-error` attribute and its siblings render normally. A node that
//! later renders cleanly has its stale `data-error` removed again.

use std::collections::HashSet;

use anyhow::{Context as _, Result, anyhow};
use sdom::{Dom, NodeId};

use crate::context::Context;
use crate::directive::{self, Directive, directive_of};
use crate::include;

pub struct Renderer<'c, C: Context> {
    pub(crate) cx: &'c mut C,
    pub(crate) include_depth: usize,
}

/// Nesting bound for includes, against include cycles.
pub(crate) const MAX_INCLUDE_DEPTH: usize = 32;

fn capture(dom: &mut Dom, id: NodeId, result: Result<()>) {
    match result {
        Ok(()) => dom.remove_attr(id, directive::ERROR),
        Err(e) => dom.set_attr(id, directive::ERROR, format!("{e:#}")),
    }
}

/// Contiguous `data-elif`/`data-else` element siblings following an
/// `data-if` node (text and comments in between are skipped); ends at
/// the first `data-else` or at the first other element.
fn branch_chain(dom: &Dom, id: NodeId) -> Vec<NodeId> {
    let parent = match dom.parent(id) {
        Some(p) => p,
        None => return Vec::new(),
    };
    let children = dom.children(parent);
    let pos = match children.iter().position(|c| *c == id) {
        Some(p) => p,
        None => return Vec::new(),
    };
    let mut chain = Vec::new();
    for &sib in &children[pos + 1..] {
        if !dom.is_element(sib) {
            continue;
        }
        match directive_of(dom, sib) {
            Some(Directive::Elif { .. }) => chain.push(sib),
            Some(Directive::Else) => {
                chain.push(sib);
                break;
            }
            _ => break,
        }
    }
    chain
}

impl<'c, C: Context> Renderer<'c, C> {
    pub fn new(cx: &'c mut C) -> Self {
        Renderer {
            cx,
            include_depth: 0,
        }
    }

    /// Render one node; failures end up as `data-error` on the node and
    /// never propagate to the parent.
    pub fn render_node(&mut self, dom: &mut Dom, id: NodeId) {
        if !dom.is_element(id) {
            return;
        }
        let result = self.dispatch(dom, id);
        capture(dom, id, result);
    }

    fn dispatch(&mut self, dom: &mut Dom, id: NodeId) -> Result<()> {
        match directive_of(dom, id) {
            None => {
                self.render_children(dom, id);
                Ok(())
            }
            Some(Directive::Code { lang }) => {
                let code = dom.text_content(id);
                self.cx
                    .execute(&code)
                    .with_context(|| anyhow!("executing {lang:?} code"))
            }
            Some(Directive::Text { expr }) => {
                let text = self.cx.write(&expr)?;
                dom.set_text(id, text);
                Ok(())
            }
            Some(Directive::Image { expr }) => {
                self.cx.image_begin(&expr)?;
                self.render_children(dom, id);
                self.cx.image_end()
            }
            Some(Directive::If { expr }) => self.render_if(dom, id, &expr),
            Some(Directive::Elif { .. }) => {
                // Reachable only outside a chain; inside one, the
                // data-if leader drives it and the parent skips it.
                Err(anyhow!("data-elif without a preceding data-if"))
            }
            Some(Directive::Else) => {
                Err(anyhow!("data-else without a preceding data-if"))
            }
            Some(Directive::Switch { expr }) => self.render_switch(dom, id, &expr),
            Some(Directive::For { spec }) => self.render_for(dom, id, &spec),
            Some(Directive::With { expr }) => self.render_with(dom, id, &expr),
            Some(Directive::Include { spec }) => {
                include::render_include(self, dom, id, &spec)
            }
        }
    }

    /// Children in document order; `data-elif`/`data-else` nodes
    /// belonging to a `data-if` chain are driven by their leader, not
    /// visited on their own.
    pub(crate) fn render_children(&mut self, dom: &mut Dom, id: NodeId) {
        let children = dom.children(id);
        let mut in_chain: HashSet<NodeId> = HashSet::new();
        for c in children {
            if in_chain.contains(&c) {
                continue;
            }
            if let Some(Directive::If { .. }) = directive_of(dom, c) {
                in_chain.extend(branch_chain(dom, c));
            }
            self.render_node(dom, c);
        }
    }

    /// Turn a branch on or off. Off nodes keep their children in the
    /// tree, inert, for a future re-render.
    fn set_branch(&mut self, dom: &mut Dom, id: NodeId, active: bool) {
        if active {
            dom.remove_attr(id, directive::OFF);
            self.render_children(dom, id);
        } else {
            dom.set_attr(id, directive::OFF, "true");
        }
    }

    fn render_if(&mut self, dom: &mut Dom, id: NodeId, expr: &str) -> Result<()> {
        let chain = branch_chain(dom, id);
        let active = self.cx.test(expr)?;
        self.set_branch(dom, id, active);
        let mut taken = active;
        for member in chain {
            let result = self.render_branch_member(dom, member, &mut taken);
            capture(dom, member, result);
        }
        Ok(())
    }

    fn render_branch_member(
        &mut self,
        dom: &mut Dom,
        member: NodeId,
        taken: &mut bool,
    ) -> Result<()> {
        match directive_of(dom, member) {
            Some(Directive::Elif { expr }) => {
                let active = !*taken && self.cx.test(&expr)?;
                if active {
                    *taken = true;
                }
                self.set_branch(dom, member, active);
                Ok(())
            }
            Some(Directive::Else) => {
                self.set_branch(dom, member, !*taken);
                *taken = true;
                Ok(())
            }
            other => Err(anyhow!("branch chain member changed under us: {other:?}")),
        }
    }

    fn render_switch(&mut self, dom: &mut Dom, id: NodeId, expr: &str) -> Result<()> {
        self.cx.mark(expr)?;
        let result = self.switch_cases(dom, id);
        let unmark = self.cx.unmark();
        result?;
        unmark
    }

    fn switch_cases(&mut self, dom: &mut Dom, id: NodeId) -> Result<()> {
        let mut matched = false;
        let mut default: Option<NodeId> = None;
        for child in dom.child_elements(id) {
            if let Some(case) = dom.attr(child, directive::CASE) {
                if matched {
                    dom.set_attr(child, directive::OFF, "true");
                    continue;
                }
                match self.cx.matches(&case) {
                    Ok(true) => {
                        matched = true;
                        dom.remove_attr(child, directive::OFF);
                        self.render_node(dom, child);
                    }
                    Ok(false) => {
                        dom.set_attr(child, directive::OFF, "true");
                    }
                    Err(e) => {
                        // The failing case is off and carries the
                        // error; the switch itself goes on.
                        dom.set_attr(child, directive::OFF, "true");
                        capture(dom, child, Err(e));
                    }
                }
            } else if dom.has_attr(child, directive::DEFAULT) {
                if default.is_none() {
                    default = Some(child);
                }
                dom.set_attr(child, directive::OFF, "true");
            }
            // Children that are neither case nor default are left
            // untouched.
        }
        if !matched {
            if let Some(d) = default {
                dom.remove_attr(d, directive::OFF);
                self.render_node(dom, d);
            }
        }
        Ok(())
    }

    fn render_for(&mut self, dom: &mut Dom, id: NodeId, spec: &str) -> Result<()> {
        let (item, items) = directive::parse_for(spec)?;
        let mut count: usize = 0;
        if self.cx.begin(&item, &items)? {
            let template = match dom.first_child_element(id) {
                Some(t) => t,
                None => {
                    // Close the iteration the context just opened.
                    while self.cx.next()? {}
                    return Err(anyhow!("data-for without a loop template child"));
                }
            };
            loop {
                let target = self.loop_target(dom, id, template, count);
                dom.set_attr(target, directive::INDEX, count.to_string());
                dom.remove_attr(target, directive::EXTRA);
                dom.remove_attr(target, directive::OFF);
                self.render_node(dom, target);
                count += 1;
                if !self.cx.next()? {
                    break;
                }
            }
        }
        // Excess children from an earlier, longer iteration are
        // removed, except where locked: those are kept and tagged.
        // With an empty sequence the index-0 child doubles as the loop
        // template, so it is turned off rather than deleted.
        for child in dom.child_elements(id) {
            match dom.attr(child, directive::INDEX).map(|ix| ix.parse::<usize>()) {
                Some(Ok(n)) if n >= count => {
                    if count == 0 && n == 0 {
                        dom.set_attr(child, directive::OFF, "true");
                    } else if directive::subtree_locked(dom, child) {
                        dom.set_attr(child, directive::EXTRA, "true");
                    } else {
                        dom.remove(child);
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// The node to render for iteration `index`: an already generated
    /// child with that index, the template itself for the first
    /// iteration, or a fresh positional copy of the template.
    fn loop_target(
        &mut self,
        dom: &mut Dom,
        id: NodeId,
        template: NodeId,
        index: usize,
    ) -> NodeId {
        let want = index.to_string();
        for child in dom.child_elements(id) {
            if dom.attr(child, directive::INDEX).as_deref() == Some(want.as_str()) {
                return child;
            }
        }
        if index == 0 {
            return template;
        }
        let prev = index - 1;
        let prev = dom
            .child_elements(id)
            .into_iter()
            .find(|c| {
                dom.attr(*c, directive::INDEX).as_deref() == Some(prev.to_string().as_str())
            })
            .expect("previous iteration's child exists, it was just rendered");
        let copy = dom.deep_clone(template);
        let pos = dom
            .position_of(id, prev)
            .expect("child_elements come from this parent");
        dom.insert_child(id, pos + 1, copy);
        copy
    }

    fn render_with(&mut self, dom: &mut Dom, id: NodeId, expr: &str) -> Result<()> {
        self.cx.enter(Some(expr))?;
        self.render_children(dom, id);
        self.cx.exit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MapContext;
    use crate::stencil::Stencil;
    use serde_json::json;

    fn render(markup: &str, cx: &mut MapContext) -> Stencil {
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(cx);
        st
    }

    fn body(st: &Stencil) -> String {
        st.content("html").unwrap()
    }

    #[test]
    fn t_code_executes() {
        let mut cx = MapContext::new();
        let st = render(
            "<code data-code=\"map\">a = 7</code><p data-text=\"a\"></p>",
            &mut cx,
        );
        assert_eq!(
            body(&st),
            "<code data-code=\"map\">a = 7</code><p data-text=\"a\">7</p>"
        );
    }

    #[test]
    fn t_if_idempotent() {
        let mut cx = MapContext::new();
        cx.define("show", true);
        let markup = "<div data-if=\"show\"><p data-text='\"y\"'></p></div>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        let once = body(&st);
        st.render(&mut cx);
        assert_eq!(body(&st), once);
        assert_eq!(once, "<div data-if=\"show\"><p data-text=\"&quot;y&quot;\">y</p></div>");

        // Flipping the condition marks the node off without deleting
        // its children.
        cx.define("show", false);
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-if=\"show\" data-off=\"true\">\
             <p data-text=\"&quot;y&quot;\">y</p></div>"
        );
    }

    #[test]
    fn t_if_elif_else() {
        let mut cx = MapContext::new();
        cx.define("a", false);
        cx.define("b", true);
        let markup = "<div data-if=\"a\">A</div>\
                      <div data-elif=\"b\">B</div>\
                      <div data-else=\"\">C</div>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-if=\"a\" data-off=\"true\">A</div>\
             <div data-elif=\"b\">B</div>\
             <div data-else=\"\" data-off=\"true\">C</div>"
        );

        cx.define("b", false);
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-if=\"a\" data-off=\"true\">A</div>\
             <div data-elif=\"b\" data-off=\"true\">B</div>\
             <div data-else=\"\">C</div>"
        );
    }

    #[test]
    fn t_orphan_elif() {
        let mut cx = MapContext::new();
        let st = render("<div data-elif=\"x\">B</div>", &mut cx);
        assert_eq!(
            body(&st),
            "<div data-elif=\"x\" \
             data-error=\"data-elif without a preceding data-if\">B</div>"
        );
    }

    #[test]
    fn t_switch_exclusive() {
        let mut cx = MapContext::new();
        cx.define("n", 2);
        let markup = "<div data-switch=\"n\">\
                      <p data-case=\"1\">one</p>\
                      <p data-case=\"2\">two</p>\
                      <p data-case=\"2\">two again</p>\
                      <p data-default=\"\">other</p>\
                      </div>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-switch=\"n\">\
             <p data-case=\"1\" data-off=\"true\">one</p>\
             <p data-case=\"2\">two</p>\
             <p data-case=\"2\" data-off=\"true\">two again</p>\
             <p data-default=\"\" data-off=\"true\">other</p>\
             </div>"
        );

        // No match: the default wins.
        cx.define("n", 9);
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<div data-switch=\"n\">\
             <p data-case=\"1\" data-off=\"true\">one</p>\
             <p data-case=\"2\" data-off=\"true\">two</p>\
             <p data-case=\"2\" data-off=\"true\">two again</p>\
             <p data-default=\"\">other</p>\
             </div>"
        );
    }

    #[test]
    fn t_for_basics() {
        let mut cx = MapContext::new();
        cx.define("items", json!(["a", "b", "c"]));
        let markup = "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\">a</li>\
             <li data-text=\"x\" data-index=\"1\">b</li>\
             <li data-text=\"x\" data-index=\"2\">c</li>\
             </ul>"
        );
    }

    #[test]
    fn t_for_shrink_removes_excess() {
        let mut cx = MapContext::new();
        cx.define("items", json!(["a", "b", "c"]));
        let markup = "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        cx.define("items", json!(["d"]));
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\">d</li>\
             </ul>"
        );
    }

    #[test]
    fn t_for_locked_excess_kept() {
        let mut cx = MapContext::new();
        cx.define("items", json!(["a", "b"]));
        let markup = "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);

        // Lock the second generated item, then shrink the sequence.
        {
            let li1 = st
                .dom()
                .resolve_first(st.body(), "[data-index=1]")
                .unwrap()
                .unwrap();
            let dom = st.dom_mut();
            dom.set_attr(li1, directive::LOCK, "true");
        }
        cx.define("items", json!(["z"]));
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\">z</li>\
             <li data-text=\"x\" data-index=\"1\" data-lock=\"true\" \
             data-extra=\"true\">b</li>\
             </ul>"
        );

        // Growing again reclaims the locked child for iteration 1.
        cx.define("items", json!(["p", "q"]));
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\">p</li>\
             <li data-text=\"x\" data-index=\"1\" data-lock=\"true\">q</li>\
             </ul>"
        );
    }

    #[test]
    fn t_for_empty_sequence() {
        let mut cx = MapContext::new();
        cx.define("items", json!([]));
        let st = render(
            "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>",
            &mut cx,
        );
        // The unrendered template is preserved for future renders.
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>"
        );
    }

    #[test]
    fn t_for_empty_then_regrow() {
        let mut cx = MapContext::new();
        cx.define("items", json!(["a"]));
        let markup = "<ul data-for=\"x in items\"><li data-text=\"x\"></li></ul>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);

        // Shrinking to empty turns the template off instead of
        // deleting it.
        cx.define("items", json!([]));
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\" data-off=\"true\">a</li>\
             </ul>"
        );

        // A later non-empty sequence renders again from the kept
        // template.
        cx.define("items", json!(["b", "c"]));
        st.render(&mut cx);
        assert_eq!(
            body(&st),
            "<ul data-for=\"x in items\">\
             <li data-text=\"x\" data-index=\"0\">b</li>\
             <li data-text=\"x\" data-index=\"1\">c</li>\
             </ul>"
        );
    }

    #[test]
    fn t_for_malformed_spec() {
        let mut cx = MapContext::new();
        let st = render("<ul data-for=\"x:items\"><li></li></ul>", &mut cx);
        assert!(body(&st).contains("data-error=\"malformed loop spec"));
    }

    #[test]
    fn t_with_scope() {
        let mut cx = MapContext::new();
        cx.define("point", json!({"x": 10, "y": 20}));
        let st = render(
            "<div data-with=\"point\"><span data-text=\"x\"></span></div>\
             <span data-text=\"point.y\"></span>",
            &mut cx,
        );
        assert_eq!(
            body(&st),
            "<div data-with=\"point\"><span data-text=\"x\">10</span></div>\
             <span data-text=\"point.y\">20</span>"
        );
    }

    #[test]
    fn t_error_contained() {
        let mut cx = MapContext::new();
        cx.define("ok", "fine");
        let st = render(
            "<p data-text=\"missing\"></p><p data-text=\"ok\"></p>",
            &mut cx,
        );
        assert_eq!(
            body(&st),
            "<p data-text=\"missing\" \
             data-error=\"unbound variable &quot;missing&quot;\"></p>\
             <p data-text=\"ok\">fine</p>"
        );
    }

    #[test]
    fn t_error_cleared_on_success() {
        let mut cx = MapContext::new();
        let markup = "<p data-text=\"v\"></p>";
        let mut st = Stencil::from_markup(markup).unwrap();
        st.render(&mut cx);
        assert!(body(&st).contains("data-error"));
        cx.define("v", "now bound");
        st.render(&mut cx);
        assert_eq!(body(&st), "<p data-text=\"v\">now bound</p>");
    }

    #[test]
    fn t_locked_node_still_renders() {
        // Locking exempts from destructive operations only; it does not
        // stop directive processing.
        let mut cx = MapContext::new();
        cx.define("v", 5);
        let st = render(
            "<p data-lock=\"true\" data-text=\"v\"></p>",
            &mut cx,
        );
        assert_eq!(body(&st), "<p data-lock=\"true\" data-text=\"v\">5</p>");
    }

    #[test]
    fn t_nested_for() {
        let mut cx = MapContext::new();
        cx.define("rows", json!([["a", "b"], ["c"]]));
        let st = render(
            "<div data-for=\"row in rows\">\
             <ul data-for=\"cell in row\"><li data-text=\"cell\"></li></ul>\
             </div>",
            &mut cx,
        );
        assert_eq!(
            body(&st),
            "<div data-for=\"row in rows\">\
             <ul data-for=\"cell in row\" data-index=\"0\">\
             <li data-text=\"cell\" data-index=\"0\">a</li>\
             <li data-text=\"cell\" data-index=\"1\">b</li>\
             </ul>\
             <ul data-for=\"cell in row\" data-index=\"1\">\
             <li data-text=\"cell\" data-index=\"0\">c</li>\
             </ul>\
             </div>",
        );
    }

    #[test]
    fn t_text_directive_wins_priority() {
        let mut cx = MapContext::new();
        cx.define("v", "text");
        let st = render("<p data-text=\"v\" data-if=\"nope\"></p>", &mut cx);
        // data-if is inert: data-text has priority and nothing tests
        // the unbound name.
        assert_eq!(
            body(&st),
            "<p data-text=\"v\" data-if=\"nope\">text</p>"
        );
    }
}
