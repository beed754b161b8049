pub mod slice;
pub mod warn;
