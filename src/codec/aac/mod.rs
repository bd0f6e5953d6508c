//! AAC audio in ADTS framing: header parsing and stream configuration.

pub mod parser;
pub mod types;

pub use parser::*;
pub use types::*;
