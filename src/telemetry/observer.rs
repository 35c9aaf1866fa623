//! Checkpoint observers feeding the recorder, stamping and reading packets

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use super::codec::{FrameMetadata, LayoutError, MetadataLayout, MissingTagTracker};
use super::frame_id::FrameIdAssigner;
use super::plan::CheckpointPlan;
use super::recorder::{Fold, FrameLatencyRecord, LatencyRecorder};
use super::stats::StageStats;
use super::view::FrameBreakdown;
use crate::config::BenchmarkSettings;
use crate::pipeline::backend::{BufferView, CheckpointObserver};
use crate::pipeline::clock::StageClock;
use crate::pipeline::health::StreamHealth;
use crate::pipeline::types::{StreamId, StreamRole, Timestamp};

/// Everything a supervisor needs to wire telemetry into a pipeline
#[derive(Clone)]
pub struct Telemetry {
    pub observer: Arc<dyn CheckpointObserver>,
    pub checkpoints: Vec<&'static str>,
    pub stats: Arc<StageStats>,
}

impl Telemetry {
    /// Telemetry for one stream slot
    pub fn for_stream(
        stream: StreamId,
        clock: Arc<dyn StageClock>,
        frame_ids: Arc<FrameIdAssigner>,
        health: Arc<StreamHealth>,
        benchmark: Option<&BenchmarkSettings>,
    ) -> Result<Self, LayoutError> {
        let plan = CheckpointPlan::for_role(stream.role());
        let checkpoints = plan.names();
        let mut recorder = LatencyRecorder::new(stream, plan);
        if let Some(settings) = benchmark {
            recorder = recorder.with_benchmark(settings);
        }

        let (observer, stats) = match stream.role() {
            StreamRole::Sender => {
                let observer = SenderTelemetry::new(stream, recorder, clock, frame_ids, health)?;
                let stats = observer.stats.clone();
                (Arc::new(observer) as Arc<dyn CheckpointObserver>, stats)
            }
            StreamRole::Receiver => {
                let observer = ReceiverTelemetry::new(stream, recorder, clock, health)?;
                let stats = observer.stats.clone();
                (Arc::new(observer) as Arc<dyn CheckpointObserver>, stats)
            }
        };

        Ok(Self {
            observer,
            checkpoints,
            stats,
        })
    }
}

fn account(stream: StreamId, fold: &Fold, health: &StreamHealth, stats: &StageStats) {
    match fold {
        Fold::Record(record) => {
            health.record_frame();
            stats.record_frame();
            for stage in &record.stages {
                stats.add(stage.name, stage.duration);
            }
        }
        Fold::Skipped => {
            debug!("[{}] incomplete frame skipped", stream);
            health.record_skip();
            stats.record_skip();
        }
    }
}

/// Sender side: assigns frame ids at ingress and stamps outgoing packets
pub struct SenderTelemetry {
    stream: StreamId,
    recorder: Mutex<LatencyRecorder>,
    layout: MetadataLayout,
    clock: Arc<dyn StageClock>,
    frame_ids: Arc<FrameIdAssigner>,
    health: Arc<StreamHealth>,
    stats: Arc<StageStats>,
}

impl SenderTelemetry {
    pub fn new(
        stream: StreamId,
        recorder: LatencyRecorder,
        clock: Arc<dyn StageClock>,
        frame_ids: Arc<FrameIdAssigner>,
        health: Arc<StreamHealth>,
    ) -> Result<Self, LayoutError> {
        let layout = MetadataLayout::new(recorder.plan().stage_count())?;
        let stats = Arc::new(StageStats::new(stream, recorder.plan().stage_labels()));
        Ok(Self {
            stream,
            recorder: Mutex::new(recorder),
            layout,
            clock,
            frame_ids,
            health,
            stats,
        })
    }

    fn stamp(&self, provisional: Option<FrameLatencyRecord>, out: BufferView<'_>) {
        let BufferView::OutgoingPacket(writer) = out else {
            return;
        };

        let mut meta = FrameMetadata::unknown(self.layout.stage_count());
        meta.frame_id = self.frame_ids.current(self.stream.side());
        meta.completed_at = Some(self.clock.realtime());
        if let Some(record) = provisional {
            for (slot, stage) in meta.stage_durations.iter_mut().zip(&record.stages) {
                *slot = Some(stage.duration);
            }
        }

        if let Err(e) = self.layout.encode(&meta, writer) {
            // First failure is loud, the rest would flood the log
            if self.health.record_codec_error() == 1 {
                warn!("[{}] cannot stamp frame metadata: {}", self.stream, e);
            } else {
                debug!("[{}] cannot stamp frame metadata: {}", self.stream, e);
            }
        }
    }
}

impl CheckpointObserver for SenderTelemetry {
    fn on_checkpoint(&self, checkpoint: &str, buffer: BufferView<'_>) {
        let now = self.clock.monotonic();
        let side = self.stream.side();
        let mut recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);

        let ingress = recorder.plan().is_ingress(checkpoint);
        if ingress {
            self.frame_ids.mark_sent(side);
        }

        if let Some(fold) = recorder.record_checkpoint(checkpoint, now) {
            account(self.stream, &fold, &self.health, &self.stats);
            if let Fold::Record(record) = &fold {
                debug!("[{}] {}", self.stream, record);
            }
        }

        if ingress {
            let id = self.frame_ids.next_id(side);
            recorder.tag_frame(id);
        }

        let provisional = if matches!(buffer, BufferView::OutgoingPacket(_)) {
            recorder.in_flight(now)
        } else {
            None
        };
        drop(recorder);

        self.stamp(provisional, buffer);
    }
}

struct ReceiverState {
    recorder: LatencyRecorder,
    latest: FrameMetadata,
    tracker: MissingTagTracker,
    arrived: Option<Timestamp>,
    last_completed: Option<u64>,
}

/// Receiver side: recovers sender metadata and reports the combined view
pub struct ReceiverTelemetry {
    stream: StreamId,
    state: Mutex<ReceiverState>,
    layout: MetadataLayout,
    sender_labels: Vec<&'static str>,
    clock: Arc<dyn StageClock>,
    health: Arc<StreamHealth>,
    stats: Arc<StageStats>,
}

impl ReceiverTelemetry {
    pub fn new(
        stream: StreamId,
        recorder: LatencyRecorder,
        clock: Arc<dyn StageClock>,
        health: Arc<StreamHealth>,
    ) -> Result<Self, LayoutError> {
        let sender_plan = CheckpointPlan::sender();
        let layout = MetadataLayout::new(sender_plan.stage_count())?;
        let sender_labels = sender_plan.stage_labels();

        // Sender stages and transit are averaged next to our own stages
        let stage_names = sender_labels
            .iter()
            .map(|label| format!("tx.{}", label))
            .chain(std::iter::once("transit".to_string()))
            .chain(recorder.plan().stage_labels().into_iter().map(String::from));
        let stats = Arc::new(StageStats::new(stream, stage_names));

        let state = ReceiverState {
            tracker: MissingTagTracker::new(stream, layout.tag_count()),
            latest: FrameMetadata::unknown(layout.stage_count()),
            recorder,
            arrived: None,
            last_completed: None,
        };

        Ok(Self {
            stream,
            state: Mutex::new(state),
            layout,
            sender_labels,
            clock,
            health,
            stats,
        })
    }

    fn report(&self, state: &mut ReceiverState, record: FrameLatencyRecord) {
        let view = FrameBreakdown::combine(
            &self.sender_labels,
            &state.latest,
            record,
            state.arrived.take(),
            state.last_completed,
        );

        for (label, duration) in &view.sender_stages {
            if let Some(d) = duration {
                self.stats.add(&format!("tx.{}", label), *d);
            }
        }
        if let Some(transit) = view.transit.measured() {
            self.stats.add("transit", transit);
        }
        if view.frame_id > state.last_completed {
            state.last_completed = view.frame_id;
        }
        debug!("[{}] {}", self.stream, view);
    }
}

impl CheckpointObserver for ReceiverTelemetry {
    fn on_checkpoint(&self, checkpoint: &str, buffer: BufferView<'_>) {
        let now = self.clock.monotonic();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let BufferView::IncomingPacket(reader) = buffer {
            let decoded = self.layout.decode(reader);
            state.tracker.observe(&decoded);
            state.latest.merge_from(&decoded);
            if let Some(id) = decoded.frame_id {
                state.recorder.tag_frame(id);
            }
            if state.arrived.is_none() {
                state.arrived = Some(self.clock.realtime());
            }
        }

        let Some(fold) = state.recorder.record_checkpoint(checkpoint, now) else {
            return;
        };
        account(self.stream, &fold, &self.health, &self.stats);
        match fold {
            Fold::Record(record) => self.report(&mut state, record),
            Fold::Skipped => state.arrived = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ManualStageClock;
    use crate::pipeline::description::{
        CAMSRC_IDENT, DEC_IDENT, DISPLAY_CONV_IDENT, ENC_IDENT, QUEUE_IDENT, RTPDEPAY_IDENT,
        RTPPAY_IDENT, UDPSRC_IDENT, VIDCONV_IDENT, VIDFLIP_IDENT,
    };
    use crate::pipeline::types::StreamSide;
    use std::time::Duration;
    use webrtc::rtp::header::Header;

    struct Rig {
        clock: ManualStageClock,
        ids: Arc<FrameIdAssigner>,
        sender_health: Arc<StreamHealth>,
        receiver_health: Arc<StreamHealth>,
        sender: Telemetry,
        receiver: Telemetry,
    }

    fn rig() -> Rig {
        let clock = ManualStageClock::new();
        clock.set_realtime_offset(1_700_000_000_000_000);
        let ids = Arc::new(FrameIdAssigner::new());
        let sender_health = Arc::new(StreamHealth::new());
        let receiver_health = Arc::new(StreamHealth::new());
        let shared: Arc<dyn StageClock> = Arc::new(clock.clone());

        let sender = Telemetry::for_stream(
            StreamId::new(StreamRole::Sender, StreamSide::Left),
            shared.clone(),
            ids.clone(),
            sender_health.clone(),
            None,
        )
        .unwrap();
        let receiver = Telemetry::for_stream(
            StreamId::new(StreamRole::Receiver, StreamSide::Left),
            shared,
            ids.clone(),
            receiver_health.clone(),
            None,
        )
        .unwrap();

        Rig {
            clock,
            ids,
            sender_health,
            receiver_health,
            sender,
            receiver,
        }
    }

    impl Rig {
        fn step(&self, micros: u64) {
            self.clock.advance(Duration::from_micros(micros));
        }

        fn send_frame(&self) -> Header {
            let tx = &self.sender.observer;
            tx.on_checkpoint(CAMSRC_IDENT, BufferView::Media);
            self.step(200);
            tx.on_checkpoint(VIDCONV_IDENT, BufferView::Media);
            self.step(1_000);
            tx.on_checkpoint(ENC_IDENT, BufferView::Media);
            self.step(100);
            let mut header = Header::default();
            tx.on_checkpoint(RTPPAY_IDENT, BufferView::OutgoingPacket(&mut header));
            header
        }

        fn receive_frame(&self, header: &Header) {
            let rx = &self.receiver.observer;
            rx.on_checkpoint(UDPSRC_IDENT, BufferView::IncomingPacket(header));
            for name in [RTPDEPAY_IDENT, DEC_IDENT, QUEUE_IDENT, DISPLAY_CONV_IDENT, VIDFLIP_IDENT] {
                self.step(100);
                rx.on_checkpoint(name, BufferView::Media);
            }
        }
    }

    #[test]
    fn test_sender_stamps_current_frame() {
        let rig = rig();
        let header = rig.send_frame();
        let layout = MetadataLayout::new(3).unwrap();
        let meta = layout.decode(&header);

        assert_eq!(meta.frame_id, Some(0));
        assert_eq!(
            meta.stage_durations,
            vec![
                Some(Duration::from_micros(200)),
                Some(Duration::from_micros(1_000)),
                Some(Duration::from_micros(100)),
            ]
        );
        assert_eq!(meta.completed_at, Some(Timestamp::from_micros(1_700_000_000_001_300)));
        assert_eq!(rig.ids.current(StreamSide::Left), Some(0));

        // The next ingress closes frame 0 and opens frame 1
        rig.step(15_000);
        let second = rig.send_frame();
        assert_eq!(layout.decode(&second).frame_id, Some(1));
        assert_eq!(rig.sender_health.frames_recorded(), 1);
    }

    #[test]
    fn test_receiver_recovers_sender_metadata() {
        let rig = rig();
        let header = rig.send_frame();
        rig.step(2_000);
        rig.receive_frame(&header);

        assert_eq!(rig.receiver_health.frames_recorded(), 1);
        let averages = rig.receiver.stats.averages();
        let get = |name: &str| averages.iter().find(|(n, _)| n == name).and_then(|(_, d)| *d);
        assert_eq!(get("tx.encode"), Some(Duration::from_micros(1_000)));
        assert_eq!(get("transit"), Some(Duration::from_micros(2_000)));
        assert_eq!(get("decode"), Some(Duration::from_micros(100)));
    }

    #[test]
    fn test_receiver_without_metadata_still_records() {
        let rig = rig();
        rig.receive_frame(&Header::default());

        assert_eq!(rig.receiver_health.frames_recorded(), 1);
        let averages = rig.receiver.stats.averages();
        assert!(averages.iter().any(|(n, d)| n == "transit" && d.is_none()));
    }
}
