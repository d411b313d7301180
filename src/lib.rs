//! Relocalization for monocular visual odometry.
//!
//! Keyframes handed over by the tracking pipeline are stored together with
//! their features and a whole-image appearance index. When tracking is lost, a
//! query frame is compared against that index and the best candidates are
//! verified geometrically with a 5-point essential matrix under RANSAC; the
//! first candidate that verifies yields the query's pose relative to it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use svo_reloc::{Frame, ImagePyramid, MultipleRelocalizer, RelocalizerConfig};
//!
//! # fn main() -> Result<(), svo_reloc::RelocError> {
//! let config = RelocalizerConfig::from_file("reloc.toml")?;
//! let relocalizer = MultipleRelocalizer::from_config(&config)?;
//!
//! let image = image::GrayImage::new(752, 480);
//! let keyframe = Frame::keyframe(0, ImagePyramid::build(image.clone(), 4)?);
//! relocalizer.add_frame(Arc::new(keyframe))?;
//!
//! let result = relocalizer.relocalize(&Frame::query(1, ImagePyramid::build(image, 4)?));
//! if let Some(id) = result.matched_id() {
//!     println!("relocalized against keyframe {id}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod algorithms;
pub mod config;
pub mod error;
pub mod node;
pub mod reloc;

pub use config::RelocalizerConfig;
pub use error::RelocError;
pub use node::{
    FrameRoute, RelocalizationPolicy, RelocalizerNode, Stage, StageControl, TrackingQuality,
    UserCommand,
};
pub use reloc::{
    cancel::CancellationToken,
    frame::{Frame, FrameId, ImagePyramid, SharedFrame},
    place_finder::{CandidateMatch, CrossCorrelationPlaceFinder, PlaceFinder},
    relocalizer::{MissReason, MultipleRelocalizer, RelocalizationOutcome, RelocalizationResult},
    relpos_finder::{
        Degeneracy, FivePointRelposFinder, RelativePose, RelposFinder, VerificationFailure,
    },
};
