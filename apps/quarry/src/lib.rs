//! # quarry
//!
//! Command line front end for quarry-core: reads a TOML schema catalog and
//! JSON query documents, runs the algebra and renders the outcome as text
//! or JSON.

pub mod cli;
pub mod documents;
