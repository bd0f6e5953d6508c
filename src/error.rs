use std::num::ParseIntError;
use thiserror::Error;

/// Wire code for [`PipelineError::NoMemory`].
pub const NO_MEMORY: i32 = -1;
/// Wire code for [`PipelineError::InvalidOperate`].
pub const INVALID_OPERATE: i32 = -2;
/// Wire code for [`PipelineError::FormatNotSupport`].
pub const FORMAT_NOT_SUPPORT: i32 = -3;
/// Wire code for [`PipelineError::DataInvalid`].
pub const DATA_INVALID: i32 = -4;
/// Wire code for [`PipelineError::CodecNotSupport`].
pub const CODEC_NOT_SUPPORT: i32 = -5;
/// Wire code for transport failures.
pub const IO_ERROR: i32 = -6;

/// Errors surfaced by the pipeline stages and their collaborators.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The buffer pool or a read buffer could not be allocated.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Protocol misuse: duplicate task id, unknown task, second outstanding pull.
    #[error("invalid operation: {0}")]
    InvalidOperate(String),

    /// No parser is compiled in for the detected container.
    #[error("format not supported: {0}")]
    FormatNotSupport(String),

    /// Probing or parsing the byte stream failed.
    #[error("invalid data: {0}")]
    DataInvalid(String),

    /// No decoder engine could be opened.
    #[error("codec not supported: {0}")]
    CodecNotSupport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream loader answered a request with a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The other side of a port went away.
    #[error("port closed")]
    PortClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("parser error: {0}")]
    Parser(String),

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

impl PipelineError {
    /// Negative code carried on the pull protocol.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::NoMemory(_) => NO_MEMORY,
            PipelineError::InvalidOperate(_) => INVALID_OPERATE,
            PipelineError::FormatNotSupport(_) => FORMAT_NOT_SUPPORT,
            PipelineError::DataInvalid(_)
            | PipelineError::Codec(_)
            | PipelineError::Parser(_)
            | PipelineError::ParseInt(_) => DATA_INVALID,
            PipelineError::CodecNotSupport(_) => CODEC_NOT_SUPPORT,
            PipelineError::Io(_) | PipelineError::Transport(_) | PipelineError::PortClosed => {
                IO_ERROR
            }
        }
    }

    /// True for failures of the byte transport rather than of the data.
    pub fn is_transport(&self) -> bool {
        self.code() == IO_ERROR
    }

    /// Collapses bitstream errors into `DataInvalid`, leaving the rest of the
    /// taxonomy untouched. Used where parser failures cross a stage boundary.
    pub fn into_data_invalid(self) -> Self {
        match self {
            PipelineError::Codec(msg) | PipelineError::Parser(msg) => {
                PipelineError::DataInvalid(msg)
            }
            PipelineError::ParseInt(e) => PipelineError::DataInvalid(e.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
