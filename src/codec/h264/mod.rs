//! # H.264/AVC bitstream helpers
//!
//! Annex-B splitting, parameter set parsing and slice classification, shared
//! by the Annex-B and MPEG-TS demuxers and by the portable decoder engine.
//!
//! ```rust
//! use avpipe::codec::h264::{split_nal_units, H264Parser};
//! use bytes::Bytes;
//!
//! let stream = Bytes::from_static(&[
//!     0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8,
//!     0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80,
//! ]);
//!
//! let mut parser = H264Parser::new();
//! parser.parse_annexb(&stream).unwrap();
//! assert_eq!(parser.dimensions(), Some((320, 240)));
//! assert_eq!(split_nal_units(&stream).len(), 2);
//! ```

pub mod parser;
pub mod types;

#[doc(inline)]
pub use parser::*;
#[doc(inline)]
pub use types::*;
