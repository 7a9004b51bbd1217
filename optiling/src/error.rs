/// Failures produced by platform parsing, validation, and tiling.
///
/// The first field of every variant is the operator name (or `"platform"` for
/// [TilingError::PlatformParseError]); the second describes the offending shape,
/// attribute, or value.
#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum TilingError {
    #[error("{0}: invalid rank: {1}")]
    InvalidRank(String, String),
    #[error("{0}: shape mismatch: {1}")]
    ShapeMismatch(String, String),
    #[error("{0}: output shape mismatch: {1}")]
    OutputShapeMismatch(String, String),
    #[error("{0}: invalid attribute: {1}")]
    InvalidAttribute(String, String),
    #[error("{0}: invalid shape: {1}")]
    InvalidShape(String, String),
    #[error("{0}: unsupported dtype or format: {1}")]
    UnsupportedDtype(String, String),
    #[error("{0}: missing tensor: {1}")]
    MissingTensor(String, String),
    #[error("{0}: no capable tiling template")]
    NoCapableTemplate(String),
    #[error("{0}: resource exceeded: {1}")]
    ResourceExceeded(String, String),
    #[error("platform info: {0}")]
    PlatformParseError(String),
}

impl TilingError {
    /// The operator the failure is attributed to.
    pub fn op(&self) -> &str {
        match self {
            TilingError::InvalidRank(op, _)
            | TilingError::ShapeMismatch(op, _)
            | TilingError::OutputShapeMismatch(op, _)
            | TilingError::InvalidAttribute(op, _)
            | TilingError::InvalidShape(op, _)
            | TilingError::UnsupportedDtype(op, _)
            | TilingError::MissingTensor(op, _)
            | TilingError::NoCapableTemplate(op)
            | TilingError::ResourceExceeded(op, _) => op,
            TilingError::PlatformParseError(_) => "platform",
        }
    }
}
