//! Higher-level data types emulated over the flat key space

pub mod hash;

pub use hash::HashAdapter;
