use thiserror::Error;

use crate::reloc::frame::FrameId;

/// Contract violations and misconfiguration surfaced to the caller.
///
/// The expected per-frame outcomes of relocalization (no candidate, no verified
/// match, degenerate geometry) are not errors and live in
/// [`crate::reloc::relocalizer::MissReason`] and
/// [`crate::reloc::relpos_finder::VerificationFailure`].
#[derive(Debug, Error)]
pub enum RelocError {
    #[error("frame {0} is already stored")]
    DuplicateId(FrameId),

    #[error("frame {0} is not flagged as a keyframe")]
    NotAKeyframe(FrameId),

    #[error("frame {0} is not stored")]
    NotFound(FrameId),

    #[error("camera model not correctly specified: {0}")]
    CameraNotConfigured(String),

    #[error("invalid image pyramid: {0}")]
    InvalidPyramid(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to read configuration")]
    Io(#[from] std::io::Error),
}
