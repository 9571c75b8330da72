//! Domain layer: cached entities and their identifiers.

pub mod entities;
pub mod types;
