/// Failures reported by libx264 or by the wrapper's own validation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The preset name was not recognized by `x264_param_default_preset`.
    #[error("unknown x264 preset {0:?}")]
    Preset(String),
    /// The profile could not be applied to the current parameters.
    #[error("could not apply x264 profile {0:?}")]
    Profile(String),
    /// `x264_encoder_open` returned null.
    #[error("could not open x264 encoder")]
    Open,
    /// `x264_encoder_headers` failed.
    #[error("could not retrieve x264 stream headers")]
    Headers,
    /// `x264_encoder_encode` failed.
    #[error("could not encode frame")]
    Encode,
    /// The input plane does not match the configured frame geometry.
    #[error("input plane is {got} bytes, encoder expects {expected}")]
    PlaneSize {
        /// Bytes provided by the caller.
        got: usize,
        /// Bytes the configured colorspace and geometry require.
        expected: usize,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
