//! Which checkpoints make up a frame and how a run of hits is folded

use crate::pipeline::description::{
    CAMSRC_IDENT, DEC_IDENT, DISPLAY_CONV_IDENT, ENC_IDENT, QUEUE_IDENT, RTPDEPAY_IDENT,
    RTPPAY_IDENT, UDPSRC_IDENT, VIDCONV_IDENT, VIDFLIP_IDENT,
};
use crate::pipeline::types::StreamRole;

/// Which hit of a checkpoint represents the frame when it fires repeatedly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    First,
    Last,
}

/// When a run of hits is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldTrigger {
    /// The ingress checkpoint of the following frame closes the pending run
    NextIngress,
    /// The last checkpoint of the plan closes the run it belongs to
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: &'static str,
    /// Label of the stage ending at this checkpoint
    pub stage: &'static str,
    pub pick: Pick,
}

impl Checkpoint {
    pub const fn new(name: &'static str, stage: &'static str, pick: Pick) -> Self {
        Self { name, stage, pick }
    }
}

/// Ordered checkpoints of one pipeline kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPlan {
    checkpoints: Vec<Checkpoint>,
    trigger: FoldTrigger,
}

impl CheckpointPlan {
    /// At least two checkpoints are needed to measure one stage
    pub fn new(checkpoints: Vec<Checkpoint>, trigger: FoldTrigger) -> Option<Self> {
        if checkpoints.len() < 2 {
            return None;
        }
        Some(Self { checkpoints, trigger })
    }

    /// Camera to network; the payloader fires once per packet
    pub fn sender() -> Self {
        Self {
            checkpoints: vec![
                Checkpoint::new(CAMSRC_IDENT, "capture", Pick::First),
                Checkpoint::new(VIDCONV_IDENT, "convert", Pick::First),
                Checkpoint::new(ENC_IDENT, "encode", Pick::First),
                Checkpoint::new(RTPPAY_IDENT, "packetize", Pick::Last),
            ],
            trigger: FoldTrigger::NextIngress,
        }
    }

    /// Network to display; the source fires once per packet
    pub fn receiver() -> Self {
        Self {
            checkpoints: vec![
                Checkpoint::new(UDPSRC_IDENT, "receive", Pick::Last),
                Checkpoint::new(RTPDEPAY_IDENT, "depayload", Pick::Last),
                Checkpoint::new(DEC_IDENT, "decode", Pick::Last),
                Checkpoint::new(QUEUE_IDENT, "queue", Pick::Last),
                Checkpoint::new(DISPLAY_CONV_IDENT, "convert", Pick::Last),
                Checkpoint::new(VIDFLIP_IDENT, "flip", Pick::Last),
            ],
            trigger: FoldTrigger::Finalize,
        }
    }

    pub fn for_role(role: StreamRole) -> Self {
        match role {
            StreamRole::Sender => Self::sender(),
            StreamRole::Receiver => Self::receiver(),
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn trigger(&self) -> FoldTrigger {
        self.trigger
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.checkpoints.iter().position(|c| c.name == name)
    }

    pub fn is_ingress(&self, name: &str) -> bool {
        self.position(name) == Some(0)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checkpoints.iter().map(|c| c.name).collect()
    }

    /// Number of measured stages (one fewer than checkpoints)
    pub fn stage_count(&self) -> usize {
        self.checkpoints.len() - 1
    }

    /// Labels of the measured stages, in pipeline order
    pub fn stage_labels(&self) -> Vec<&'static str> {
        self.checkpoints[1..].iter().map(|c| c.stage).collect()
    }
}
