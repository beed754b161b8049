//! The execution context protocol: the contract every embedded-language
//! backend implements, plus `MapContext`, the reference in-memory
//! backend over `serde_json::Value` bindings.
//!
//! Scopes form a stack, not a tree; `enter` pushes on top of the
//! current stack wherever in the document it is called from, and the
//! renderer guarantees balanced `enter`/`exit` per node.

use anyhow::{Context as _, Result, anyhow, bail};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unbound variable {0:?}")]
    UnboundVariable(String),
    #[error("no member {member:?} in {value}")]
    NoSuchMember { member: String, value: String },
    #[error("match without a marked subject")]
    NoSubject,
    #[error("next without an open iteration")]
    NoIteration,
    #[error("not a sequence: {0}")]
    NotASequence(String),
    #[error("not an object: {0}")]
    NotAnObject(String),
    #[error("scope stack underflow")]
    ScopeUnderflow,
}

/// What the renderer needs from an embedded-language backend. One
/// context serves one render pass; a single instance must not be used
/// by two renders concurrently (the scope stack is not reentrant).
pub trait Context {
    /// Run code for side effects only, in the innermost scope.
    fn execute(&mut self, code: &str) -> Result<()>;

    /// Evaluate `expression` and bind `name` in the innermost scope,
    /// shadowing any outer binding of the same name.
    fn assign(&mut self, name: &str, expression: &str) -> Result<()>;

    /// Evaluate and stringify `expression`. Referencing a name bound in
    /// no scope on the stack is an error.
    fn write(&mut self, expression: &str) -> Result<String>;

    /// Evaluate `expression` to its truthiness.
    fn test(&mut self, expression: &str) -> Result<bool>;

    /// Set the implicit subject for subsequent `matches` calls.
    fn mark(&mut self, expression: &str) -> Result<()>;

    /// Evaluate `candidate` and compare it to the marked subject.
    fn matches(&mut self, candidate: &str) -> Result<bool>;

    /// Clear the subject set by the most recent `mark`.
    fn unmark(&mut self) -> Result<()>;

    /// Evaluate `items_expression` to a sequence; bind its first
    /// element to `item` and return true, or return false for an empty
    /// sequence (binding nothing). Iterations nest.
    fn begin(&mut self, item: &str, items_expression: &str) -> Result<bool>;

    /// Advance the innermost iteration, rebinding its item; false once
    /// exhausted, at which point the item is unbound.
    fn next(&mut self) -> Result<bool>;

    /// Push one scope. With an expression, the expression's result
    /// provides the new scope's bindings (object members become
    /// bindings).
    fn enter(&mut self, expression: Option<&str>) -> Result<()>;

    /// Pop exactly the most recently pushed scope.
    fn exit(&mut self) -> Result<()>;

    /// Media extension point (around rendering an image directive's
    /// children). Backends without media support ignore it.
    fn image_begin(&mut self, _expression: &str) -> Result<()> {
        Ok(())
    }
    fn image_end(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Iteration {
    name: String,
    items: Vec<Value>,
    index: usize,
    // Scope stack depth at `begin`; item rebinding happens in that
    // frame, which is current again by the time `next` is called.
    depth: usize,
}

/// Reference backend: bindings are JSON values, expressions are JSON
/// literals or dotted variable paths, `execute` accepts `name = expr`
/// assignment lines. Deliberately small; real language backends live
/// behind the same trait.
pub struct MapContext {
    scopes: Vec<Map<String, Value>>,
    subjects: Vec<Value>,
    iterations: Vec<Iteration>,
}

impl MapContext {
    pub fn new() -> Self {
        MapContext {
            scopes: vec![Map::new()],
            subjects: Vec::new(),
            iterations: Vec::new(),
        }
    }

    /// Bind a value in the innermost scope, for setting up globals.
    pub fn define<V: Into<Value>>(&mut self, name: &str, value: V) {
        self.scopes
            .last_mut()
            .expect("at least the base frame")
            .insert(name.to_string(), value.into());
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|frame| frame.get(name))
    }

    fn eval(&self, expression: &str) -> Result<Value> {
        let expr = expression.trim();
        if expr.is_empty() {
            bail!("empty expression")
        }
        let c = expr.chars().next().expect("non-empty");
        let literal = c == '"'
            || c == '['
            || c == '{'
            || c == '-'
            || c.is_ascii_digit()
            || expr == "true"
            || expr == "false"
            || expr == "null";
        if literal {
            return serde_json::from_str(expr)
                .with_context(|| anyhow!("invalid literal {expr:?}"));
        }
        let mut parts = expr.split('.');
        let name = parts.next().expect("split yields at least one part");
        let mut val = self
            .lookup(name)
            .ok_or_else(|| ContextError::UnboundVariable(name.to_string()))?
            .clone();
        for part in parts {
            let member = || ContextError::NoSuchMember {
                member: part.to_string(),
                value: val.to_string(),
            };
            val = match &val {
                Value::Object(m) => m.get(part).ok_or_else(member)?.clone(),
                Value::Array(a) => {
                    let i: usize = part.parse().map_err(|_| member())?;
                    a.get(i).ok_or_else(member)?.clone()
                }
                _ => return Err(member().into()),
            };
        }
        Ok(val)
    }
}

fn truthy(val: &Value) -> bool {
    match val {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn stringify(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Context for MapContext {
    fn execute(&mut self, code: &str) -> Result<()> {
        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, expr) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("unsupported statement {line:?}"))?;
            self.assign(name.trim(), expr.trim())?;
        }
        Ok(())
    }

    fn assign(&mut self, name: &str, expression: &str) -> Result<()> {
        let val = self.eval(expression)?;
        self.scopes
            .last_mut()
            .expect("at least the base frame")
            .insert(name.to_string(), val);
        Ok(())
    }

    fn write(&mut self, expression: &str) -> Result<String> {
        Ok(stringify(&self.eval(expression)?))
    }

    fn test(&mut self, expression: &str) -> Result<bool> {
        Ok(truthy(&self.eval(expression)?))
    }

    fn mark(&mut self, expression: &str) -> Result<()> {
        let subject = self.eval(expression)?;
        self.subjects.push(subject);
        Ok(())
    }

    fn matches(&mut self, candidate: &str) -> Result<bool> {
        let candidate = self.eval(candidate)?;
        let subject = self.subjects.last().ok_or(ContextError::NoSubject)?;
        Ok(candidate == *subject)
    }

    fn unmark(&mut self) -> Result<()> {
        self.subjects.pop().ok_or(ContextError::NoSubject)?;
        Ok(())
    }

    fn begin(&mut self, item: &str, items_expression: &str) -> Result<bool> {
        let items = match self.eval(items_expression)? {
            Value::Array(a) => a,
            other => return Err(ContextError::NotASequence(other.to_string()).into()),
        };
        if items.is_empty() {
            return Ok(false);
        }
        let depth = self.scopes.len() - 1;
        self.scopes[depth].insert(item.to_string(), items[0].clone());
        self.iterations.push(Iteration {
            name: item.to_string(),
            items,
            index: 0,
            depth,
        });
        Ok(true)
    }

    fn next(&mut self) -> Result<bool> {
        let it = self
            .iterations
            .last_mut()
            .ok_or(ContextError::NoIteration)?;
        it.index += 1;
        if it.index < it.items.len() {
            let val = it.items[it.index].clone();
            let depth = it.depth;
            let name = it.name.clone();
            self.scopes[depth].insert(name, val);
            Ok(true)
        } else {
            let it = self.iterations.pop().expect("checked above");
            self.scopes[it.depth].remove(&it.name);
            Ok(false)
        }
    }

    fn enter(&mut self, expression: Option<&str>) -> Result<()> {
        let frame = match expression {
            None => Map::new(),
            Some(expr) => match self.eval(expr)? {
                Value::Object(m) => m,
                other => {
                    return Err(ContextError::NotAnObject(other.to_string()).into())
                }
            },
        };
        self.scopes.push(frame);
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        if self.scopes.len() <= 1 {
            return Err(ContextError::ScopeUnderflow.into());
        }
        self.scopes.pop();
        Ok(())
    }
}
