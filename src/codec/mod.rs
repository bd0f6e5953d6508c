//! Bitstream helpers for the codecs the demuxers understand, and the decoder
//! engines driven by the decode stage.

pub mod aac;
pub mod engine;
pub mod h264;
pub mod h265;

pub use engine::{
    DecoderEngine, DefaultEngineFactory, EngineContext, EngineEvent, EngineFactory, EngineKind,
    EngineMessage, SkipPolicy,
};
