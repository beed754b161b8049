//! API-level errors: failures outside the per-node render loop, which
//! propagate to the caller. Per-node render failures never appear here;
//! they are captured as `data-error` attributes on the failing node.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StencilError {
    /// `from()` got a locator without `://` or with an unknown scheme.
    #[error("unrecognized source locator scheme in {0:?}")]
    UnrecognizedScheme(String),

    /// `content()` got a language tag this build does not support.
    #[error("content language {0:?} is not implemented")]
    NotImplemented(String),

    /// `id://` load for an id nothing was registered under.
    #[error("no stencil registered under id {0:?}")]
    UnknownId(String),
}

/// An include names a parameter with no supplied value and no default.
/// Raised during include processing, i.e. inside the per-node catch; it
/// surfaces as `data-error` on the include node.
#[derive(Debug, Error)]
#[error("missing required parameter {0:?}")]
pub struct MissingParameter(pub String);
