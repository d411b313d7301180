use std::sync::Arc;

use nalgebra::Isometry3;

pub use crate::algorithms::pyramid::ImagePyramid;

/// Unique identity of a frame, assigned by the tracking pipeline.
pub type FrameId = u64;

/// One captured camera image with its pose estimate.
///
/// Frames are immutable after construction and handed around as [`SharedFrame`],
/// so the relocalizer and the tracking pipeline can hold the same frame at once.
#[derive(Debug, Clone)]
pub struct Frame {
    id: FrameId,
    pyramid: ImagePyramid,
    /// `T_frame_world`: maps world coordinates into this camera's frame.
    pose: Isometry3<f64>,
    is_keyframe: bool,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
    pub fn new(
        id: FrameId,
        pyramid: ImagePyramid,
        pose: Isometry3<f64>,
        is_keyframe: bool,
    ) -> Self {
        Self {
            id,
            pyramid,
            pose,
            is_keyframe,
        }
    }

    /// Keyframe with an identity pose, mostly useful in tests.
    pub fn keyframe(id: FrameId, pyramid: ImagePyramid) -> Self {
        Self::new(id, pyramid, Isometry3::identity(), true)
    }

    /// Frame for which no pose is known yet.
    pub fn query(id: FrameId, pyramid: ImagePyramid) -> Self {
        Self::new(id, pyramid, Isometry3::identity(), false)
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn pyramid(&self) -> &ImagePyramid {
        &self.pyramid
    }

    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }
}
