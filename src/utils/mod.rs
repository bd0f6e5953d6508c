//! # Utility Functions and Types
//!
//! Bit-level reading for codec headers and the MPEG-2 CRC used to validate
//! transport stream tables.
//!
//! ```rust
//! use avpipe::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let mut section = vec![0x00, 0xB0, 0x0D];
//! let value = crc.calculate(&section);
//! section.extend_from_slice(&value.to_be_bytes());
//! assert!(crc.verify(&section));
//! ```

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// CRC calculation implementations
pub mod crc;

pub use bits::*;
pub use crc::Crc32Mpeg2;
