//! Collection of general geometry and vision kernels used by the relocalizer,
//! none of which know about keyframes or the database.

pub mod brief;
pub mod camera;
pub mod five_point;
pub mod pyramid;
pub mod ransac;
pub mod triangulation;
