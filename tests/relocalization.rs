mod common;

use common::{frame, relocalizer, scene, LayeredScene, Relocalizer};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use svo_reloc::{MissReason, MultipleRelocalizer, RelocalizationOutcome, RelposFinder};

/// Query camera of the layered scene: sideways with a little yaw and pitch.
fn moved_view() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(-0.6, 0.08, 0.1),
        UnitQuaternion::from_euler_angles(0.01, 0.03, 0.0),
    )
}

/// Accepts any retrieved keyframe so verification alone decides.
fn permissive_relocalizer() -> Relocalizer {
    let mut config = common::config();
    config.place_finder.min_score = 0.0;
    MultipleRelocalizer::from_config(&config).unwrap()
}

#[test]
fn keyframe_relocalizes_against_itself() {
    let relocalizer = relocalizer();
    for id in 0..4 {
        relocalizer.add_frame(frame(id, scene(id), true)).unwrap();
    }

    for id in 0..4 {
        let query = frame(100 + id, scene(id), false);
        let result = relocalizer.relocalize(&query);

        assert!(result.found(), "keyframe {id}: {:?}", result.miss_reason());
        assert_eq!(result.matched_id(), Some(id));

        let pose = result.relative_pose().unwrap();
        assert!(pose.rotation_angle() < 1e-6);
        assert!(pose.translation_direction.is_none());
        assert!(pose.inlier_count as f64 >= 0.95 * pose.correspondence_count as f64);
        assert!(pose.correspondence_count >= 15);
    }
}

#[test]
fn recovered_pose_is_the_keyframe_pose() {
    let relocalizer = relocalizer();
    let keyframe = frame(7, scene(7), true);
    relocalizer.add_frame(keyframe.clone()).unwrap();

    let result = relocalizer.relocalize(&frame(8, scene(7), false));
    match &result.outcome {
        RelocalizationOutcome::Found { keyframe_pose, .. } => {
            assert_eq!(keyframe_pose, keyframe.pose())
        }
        other => panic!("not found: {other:?}"),
    }
    let pose = result.query_pose(1.0).unwrap();
    assert!((pose.translation.vector - keyframe.pose().translation.vector).norm() < 1e-6);
}

#[test]
fn empty_database_has_no_candidate() {
    let relocalizer = relocalizer();
    let result = relocalizer.relocalize(&frame(1, scene(1), false));
    assert_eq!(result.miss_reason(), Some(MissReason::NoCandidate));
    assert!(result.attempts.is_empty());
}

#[test]
fn unrelated_scene_is_not_relocalized() {
    let relocalizer = relocalizer();
    relocalizer.add_frame(frame(1, scene(1), true)).unwrap();

    let result = relocalizer.relocalize(&frame(2, scene(99), false));
    assert!(!result.found());
    assert!(matches!(
        result.miss_reason(),
        Some(MissReason::NoCandidate | MissReason::NoVerifiedMatch)
    ));
}

#[test]
fn verification_respects_caps() {
    let config = common::config();
    let relocalizer = relocalizer();
    for id in 0..8 {
        relocalizer.add_frame(frame(id, scene(id), true)).unwrap();
    }

    let result = relocalizer.relocalize(&frame(50, scene(200), false));
    assert!(result.attempts.len() <= config.relocalizer.max_candidates);
    for attempt in &result.attempts {
        assert!(attempt.iterations <= config.ransac.max_iterations);
    }
}

#[test]
fn estimate_between_frames_of_one_scene() {
    let relocalizer = relocalizer();
    let a = frame(1, scene(3), true);
    let b = frame(2, scene(3), false);

    let verification = relocalizer.relpos_finder().estimate(&b, &a);
    let pose = verification.outcome.unwrap();
    assert!(pose.rotation_angle() < 1e-6);
    assert_eq!(verification.correspondences, pose.correspondence_count);
}

#[test]
fn relocalizes_across_a_real_baseline() {
    let layers = LayeredScene::new(11);
    let view = moved_view();

    let relocalizer = permissive_relocalizer();
    relocalizer.add_frame(frame(0, layers.render(&Isometry3::identity()), true)).unwrap();
    let result = relocalizer.relocalize(&frame(1, layers.render(&view), false));

    assert!(result.found(), "{:?}", result.attempts);
    assert_eq!(result.matched_id(), Some(0));

    let pose = result.relative_pose().unwrap();
    let rotation_error =
        UnitQuaternion::from_rotation_matrix(&pose.rotation).angle_to(&view.rotation);
    assert!(rotation_error.to_degrees() < 1.0, "rotation off by {rotation_error}");

    let direction = pose.translation_direction.expect("baseline should be observed");
    let truth: Vector3<f64> = view.translation.vector.normalize();
    assert!(direction.angle(&truth).to_degrees() < 1.0, "direction {direction:?}");
    assert!(pose.inlier_count >= 30);
}

#[test]
fn estimate_observes_baseline_between_rendered_views() {
    let layers = LayeredScene::new(12);
    let view = moved_view();
    let keyframe = frame(1, layers.render(&Isometry3::identity()), true);
    let query = frame(2, layers.render(&view), false);

    let verification = permissive_relocalizer().relpos_finder().estimate(&query, &keyframe);
    let pose = verification.outcome.unwrap();
    let truth: Vector3<f64> = view.translation.vector.normalize();
    assert!(pose.translation_direction.unwrap().angle(&truth).to_degrees() < 1.0);
}
