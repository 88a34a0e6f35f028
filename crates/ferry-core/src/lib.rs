//! # Ferry Core
//!
//! Error and result types shared by the Ferry job engine crates.

pub mod error;
pub mod result;

pub use error::*;
pub use result::*;
