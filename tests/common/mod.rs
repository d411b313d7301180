#![allow(dead_code)]

use std::sync::Arc;

use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Point3, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use svo_reloc::{
    config::CameraConfig, CrossCorrelationPlaceFinder, FivePointRelposFinder, Frame, FrameId,
    ImagePyramid, MultipleRelocalizer, RelocalizerConfig, SharedFrame,
};

pub type Relocalizer = MultipleRelocalizer<CrossCorrelationPlaceFinder, FivePointRelposFinder>;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;
pub const FOCAL: f64 = 300.0;

pub fn config() -> RelocalizerConfig {
    RelocalizerConfig {
        camera: Some(CameraConfig {
            width: WIDTH,
            height: HEIGHT,
            fx: FOCAL,
            fy: FOCAL,
            cx: WIDTH as f64 / 2.0,
            cy: HEIGHT as f64 / 2.0,
            distortion: Vec::new(),
        }),
        ..RelocalizerConfig::default()
    }
}

pub fn relocalizer() -> Relocalizer {
    MultipleRelocalizer::from_config(&config()).unwrap()
}

/// Random grey blocks of varying size: textured enough for FAST and distinct per seed.
pub fn scene(seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut image = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([128]));
    for _ in 0..400 {
        let (w, h) = (rng.gen_range(6..24), rng.gen_range(6..24));
        let (x0, y0) = (rng.gen_range(0..WIDTH - w), rng.gen_range(0..HEIGHT - h));
        let value = Luma([rng.gen()]);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                image.put_pixel(x, y, value);
            }
        }
    }
    image
}

pub fn frame(id: FrameId, image: GrayImage, is_keyframe: bool) -> SharedFrame {
    let pyramid = ImagePyramid::build(image, 3).unwrap();
    let pose = Isometry3::translation(0.1 * id as f64, 0.0, 0.0);
    Arc::new(Frame::new(id, pyramid, pose, is_keyframe))
}

const CARD_DEPTH: f64 = 3.0;
const CARD_CELL: f64 = 0.1;
const CARD_HALF_SIZE: (f64, f64) = (0.7, 0.5);
const CARD_CELLS: i64 = 16;

const BACKDROP_DEPTH: f64 = 10.0;
const BACKDROP_CELL: f64 = 0.35;
const BACKDROP_CELLS: i64 = 48;

/// Two fronto-parallel block-textured layers in keyframe coordinates: a wide
/// backdrop and a nearer card covering the middle of the view. Moving the
/// camera makes the layers slide by different amounts.
pub struct LayeredScene {
    card: Vec<u8>,
    backdrop: Vec<u8>,
}

impl LayeredScene {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let card = (0..CARD_CELLS * CARD_CELLS).map(|_| rng.gen()).collect();
        let backdrop = (0..BACKDROP_CELLS * BACKDROP_CELLS).map(|_| rng.gen()).collect();
        Self { card, backdrop }
    }

    /// View from a camera with `X_camera = view * X_keyframe`, 2x2 supersampled.
    pub fn render(&self, view: &Isometry3<f64>) -> GrayImage {
        let inverse = view.inverse();
        let center = inverse * Point3::origin();
        let (cx, cy) = (WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0);

        GrayImage::from_fn(WIDTH, HEIGHT, |u, v| {
            let mut sum = 0.0;
            for (du, dv) in [(-0.25, -0.25), (0.25, -0.25), (-0.25, 0.25), (0.25, 0.25)] {
                let (x, y) = ((u as f64 + du - cx) / FOCAL, (v as f64 + dv - cy) / FOCAL);
                sum += self.shade(&center, &(inverse.rotation * Vector3::new(x, y, 1.0)));
            }
            Luma([(sum / 4.0).round() as u8])
        })
    }

    fn shade(&self, center: &Point3<f64>, direction: &Vector3<f64>) -> f64 {
        let hit = *center + direction * ((CARD_DEPTH - center.z) / direction.z);
        if hit.x.abs() < CARD_HALF_SIZE.0 && hit.y.abs() < CARD_HALF_SIZE.1 {
            return cell(&self.card, CARD_CELLS, CARD_CELL, &hit);
        }
        let hit = *center + direction * ((BACKDROP_DEPTH - center.z) / direction.z);
        cell(&self.backdrop, BACKDROP_CELLS, BACKDROP_CELL, &hit)
    }
}

fn cell(values: &[u8], cells: i64, size: f64, hit: &Point3<f64>) -> f64 {
    let i = ((hit.x / size).floor() as i64 + cells / 2).clamp(0, cells - 1);
    let j = ((hit.y / size).floor() as i64 + cells / 2).clamp(0, cells - 1);
    values[(j * cells + i) as usize] as f64
}
