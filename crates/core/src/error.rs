/// Result alias that carries the custom [`VizError`] type.
pub type Result<T> = std::result::Result<T, VizError>;

/// Common error type for the core crate.
///
/// End-of-stream and device underruns are deliberately absent: they are
/// ordinary outcomes reported through [`crate::SourceRead`] and
/// [`crate::DeviceWrite`].
#[derive(Debug, thiserror::Error)]
pub enum VizError {
    /// Bad command line arguments, missing input files or unknown presets.
    #[error("configuration error: {0}")]
    Config(String),
    /// The requested playback device could not be opened.
    #[error("failed to open playback device: {0}")]
    DeviceOpen(String),
    /// The encoder pipe refused (part of) a frame. Always fatal to the session.
    #[error("encoder pipe write failed after {written} of {expected} bytes: {source}")]
    EncodeWrite {
        written: usize,
        expected: usize,
        #[source]
        source: std::io::Error,
    },
    /// Generic message, used by collaborators without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// WAV decoding failures.
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
    /// Config and preset (de)serialisation failures.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// FFT planning or execution failures inside the software engine.
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl VizError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`VizError::Config`].
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit status the binary reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::DeviceOpen(_) => 3,
            Self::EncodeWrite { .. } => 4,
            _ => 1,
        }
    }
}

impl From<&str> for VizError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VizError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
