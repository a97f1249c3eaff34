//! Concrete sources and pipe elements, and the registry that assembles them into pipelines.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod destinations;
pub mod inference;
pub mod registry;
pub mod sources;
pub mod timeline;
pub mod transforms;
