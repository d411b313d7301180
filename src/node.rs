//! Drives the relocalizer from the tracking pipeline's frame stream: keyframes
//! are stored, other frames are relocalized when the configured policy asks
//! for it, and a small stage machine lets an operator start, pause or stop it.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::{
    error::RelocError,
    reloc::{
        frame::SharedFrame,
        place_finder::PlaceFinder,
        relocalizer::{MultipleRelocalizer, RelocalizationResult},
        relpos_finder::RelposFinder,
    },
};

/// When a regular (non-keyframe) frame is sent to `relocalize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocalizationPolicy {
    /// Shadow-verify every frame, useful for evaluation.
    EveryFrame,
    WhenUncertain,
    #[default]
    OnTrackingLoss,
    Never,
}

/// Tracking states reported by the pipeline alongside each frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackingQuality {
    #[default]
    Ok,
    Uncertain,
    Lost,
}

impl RelocalizationPolicy {
    pub fn should_relocalize(self, quality: TrackingQuality) -> bool {
        match self {
            Self::EveryFrame => true,
            Self::WhenUncertain => quality != TrackingQuality::Ok,
            Self::OnTrackingLoss => quality == TrackingQuality::Lost,
            Self::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Paused,
    Running,
    Stopped,
}

/// Operator commands, typed on the console or sent remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Start,
    Pause,
    /// Back to paused, ready to be started again.
    Reset,
    Quit,
}

impl UserCommand {
    pub fn from_key(key: char) -> Option<Self> {
        match key.to_ascii_lowercase() {
            's' => Some(Self::Start),
            'p' => Some(Self::Pause),
            'r' => Some(Self::Reset),
            'q' => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Stage shared between the frame loop and whoever handles user input.
#[derive(Debug, Default)]
pub struct StageControl {
    stage: Mutex<Stage>,
    changed: Condvar,
}

impl StageControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Apply a command and wake every waiter. `Stopped` is final.
    pub fn apply(&self, command: UserCommand) -> Stage {
        let mut stage = self.stage.lock();
        if *stage != Stage::Stopped {
            *stage = match command {
                UserCommand::Start => Stage::Running,
                UserCommand::Pause | UserCommand::Reset => Stage::Paused,
                UserCommand::Quit => Stage::Stopped,
            };
            log::info!("{command:?}: stage is now {:?}", *stage);
        }
        self.changed.notify_all();
        *stage
    }

    /// Block until the stage leaves `Paused`.
    pub fn wait_while_paused(&self) -> Stage {
        let mut stage = self.stage.lock();
        while *stage == Stage::Paused {
            self.changed.wait(&mut stage);
        }
        *stage
    }

    /// Like [`Self::wait_while_paused`], giving up after `timeout`.
    pub fn wait_while_paused_for(&self, timeout: Duration) -> Stage {
        let mut stage = self.stage.lock();
        if *stage == Stage::Paused {
            self.changed.wait_for(&mut stage, timeout);
        }
        *stage
    }
}

/// What happened to one frame handed to [`RelocalizerNode::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRoute {
    /// The node is not running.
    Skipped,
    /// Keyframe stored in this database slot.
    Stored { slot: usize },
    Relocalized(RelocalizationResult),
    /// Regular frame the policy did not relocalize.
    PassedThrough,
}

pub struct RelocalizerNode<P, R: RelposFinder> {
    relocalizer: Arc<MultipleRelocalizer<P, R>>,
    control: Arc<StageControl>,
    policy: RelocalizationPolicy,
}

impl<P: PlaceFinder, R: RelposFinder> RelocalizerNode<P, R> {
    /// Uses the policy from the relocalizer's settings.
    pub fn new(relocalizer: Arc<MultipleRelocalizer<P, R>>) -> Self {
        let policy = relocalizer.settings().policy;
        Self {
            relocalizer,
            control: Arc::new(StageControl::new()),
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RelocalizationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn relocalizer(&self) -> &Arc<MultipleRelocalizer<P, R>> {
        &self.relocalizer
    }

    pub fn control(&self) -> &Arc<StageControl> {
        &self.control
    }

    pub fn policy(&self) -> RelocalizationPolicy {
        self.policy
    }

    /// Parse a key press and apply it. Unknown keys are ignored.
    pub fn handle_key(&self, key: char) -> Option<Stage> {
        UserCommand::from_key(key).map(|command| self.control.apply(command))
    }

    pub fn process(
        &self,
        frame: SharedFrame,
        quality: TrackingQuality,
    ) -> Result<FrameRoute, RelocError> {
        if self.control.stage() != Stage::Running {
            return Ok(FrameRoute::Skipped);
        }

        if frame.is_keyframe() {
            let slot = self.relocalizer.add_frame(frame)?;
            return Ok(FrameRoute::Stored { slot });
        }

        if !self.policy.should_relocalize(quality) {
            return Ok(FrameRoute::PassedThrough);
        }

        let result = self.relocalizer.relocalize(&frame);
        match result.matched_id() {
            Some(matched) => log::info!("frame {} matched keyframe {matched}", frame.id()),
            None => log::debug!("frame {} not relocalized: {:?}", frame.id(), result.miss_reason()),
        }
        Ok(FrameRoute::Relocalized(result))
    }
}
