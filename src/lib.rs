pub mod context;
pub mod directive;
pub mod error;
pub mod include;
pub mod registry;
pub mod render;
pub mod stencil;

pub use context::{Context, ContextError, MapContext};
pub use error::{MissingParameter, StencilError};
pub use stencil::Stencil;
