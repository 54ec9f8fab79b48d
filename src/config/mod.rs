//! Connection options
//!
//! One flat option set shared by every transport; each backend reads the
//! fields it understands and ignores the rest.

mod settings;

pub use settings::*;
