//! Resource graph module.
//!
//! Turns declared specs into a dependency DAG and resolves the
//! `${provider.type.name.attr}` references that form its edges.

mod builder;
mod reference;

pub use builder::ResourceGraph;
pub use reference::{
    ID_ATTRIBUTE, Reference, Resolution, escape_literal, extract_references, lookup_path,
    references_in, resolve_attributes, resolve_value,
};
