//! The relocalization engine: a keyframe database, appearance-based place
//! retrieval and geometric verification, combined by [`relocalizer::MultipleRelocalizer`].

pub mod cancel;
pub mod features;
pub mod frame;
pub mod keyframe_db;
pub mod place_finder;
pub mod relocalizer;
pub mod relpos_finder;
