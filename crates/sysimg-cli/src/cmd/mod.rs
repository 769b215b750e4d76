//! One module per binary.

pub mod import;
pub mod keygen;
pub mod mirror;
