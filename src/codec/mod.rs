//! IQ compression support.
//!
//! Two transports: streaming FLAC (sample-granular, with a cached stream
//! header so late joiners can initialise their decoder) and
//! block-oriented deflate (each wire frame is an independently decodable
//! zlib stream).

pub mod flac;
pub mod zlib;

/// Common codec error type
#[derive(Debug)]
pub enum CodecError {
    /// Encoder/decoder not initialized
    NotInitialized,
    /// Invalid input data
    InvalidInput,
    /// Codec library error with message
    Library(String),
    /// Other error with message
    Other(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::NotInitialized => write!(f, "Codec not initialized"),
            CodecError::InvalidInput => write!(f, "Invalid input data"),
            CodecError::Library(msg) => write!(f, "Codec library error: {}", msg),
            CodecError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Wire compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Flac,
    Zlib,
}

impl Compression {
    pub fn parse(s: &str) -> Option<Compression> {
        match s {
            "none" => Some(Compression::None),
            "flac" => Some(Compression::Flac),
            "zlib" => Some(Compression::Zlib),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Flac => write!(f, "flac"),
            Compression::Zlib => write!(f, "zlib"),
        }
    }
}
