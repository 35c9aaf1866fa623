//! In-process stand-in for the media framework
//!
//! Parses the same textual descriptions the real framework would get, drives
//! checkpoint callbacks from a frame generator thread and moves RTP packets
//! between sender and receiver pipelines over a loopback keyed by UDP port.
//! Faults can be injected per pipeline name, and builds and property changes
//! are recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

use super::backend::{
    BackendError, BufferView, BusEvent, CheckpointObserver, MediaBackend, PipelineHandle,
    PropertyValue, TargetState,
};

const PACKETS_PER_FRAME: usize = 3;
const STAGE_WORK: Duration = Duration::from_micros(300);
const QUEUE_CAPACITY: usize = 512;
const SSRC: u32 = 0x7e1e_ca57;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    fail_builds: u32,
    fail_plays: u32,
    reject_properties: bool,
    hang_on_stop: bool,
}

/// A property change that reached a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySet {
    pub pipeline: String,
    pub element: String,
    pub key: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    Media,
    Packet,
}

#[derive(Debug, Clone, Default)]
struct ParsedPipeline {
    elements: Vec<String>,
    checkpoints: Vec<(String, Payload)>,
    port: Option<u16>,
    fps: u32,
    receiver: bool,
}

fn parse(description: &str) -> Result<ParsedPipeline, BackendError> {
    let mut parsed = ParsedPipeline {
        fps: 30,
        ..ParsedPipeline::default()
    };
    let mut packets = false;

    for (index, segment) in description.split('!').map(str::trim).enumerate() {
        let mut tokens = segment.split_whitespace();
        let Some(factory) = tokens.next() else {
            return Err(BackendError::Parse(format!("empty element at position {}", index)));
        };

        // Caps filters carry the frame rate and nothing else we need
        if factory.contains('/') {
            if let Some(fps) = caps_framerate(factory) {
                parsed.fps = fps;
            }
            continue;
        }

        if index == 0 && factory == "udpsrc" {
            parsed.receiver = true;
            packets = true;
        } else if factory.ends_with("depay") {
            packets = false;
        } else if factory.starts_with("rtp") && factory.ends_with("pay") {
            packets = true;
        }

        let mut name = None;
        for (key, value) in tokens.filter_map(|t| t.split_once('=')) {
            match key {
                "name" => name = Some(value.to_string()),
                "port" => {
                    let port = value
                        .parse()
                        .map_err(|_| BackendError::Parse(format!("bad port `{}`", value)))?;
                    parsed.port = Some(port);
                }
                _ => {}
            }
        }

        if let Some(name) = name {
            if factory == "identity" {
                let payload = if packets { Payload::Packet } else { Payload::Media };
                parsed.checkpoints.push((name.clone(), payload));
            }
            parsed.elements.push(name);
        }
    }

    Ok(parsed)
}

fn caps_framerate(caps: &str) -> Option<u32> {
    let rest = caps.split("framerate=(fraction)").nth(1)?;
    rest.split('/').next()?.parse().ok()
}

/// Packets in flight between pipelines, per destination port
#[derive(Default)]
struct Loopback {
    queues: Mutex<HashMap<u16, VecDeque<Bytes>>>,
    ready: Condvar,
}

impl Loopback {
    fn push(&self, port: u16, packet: Bytes) {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(port).or_default();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(packet);
        self.ready.notify_all();
    }

    fn pop(&self, port: u16, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut queues = lock(&self.queues);
        loop {
            if let Some(packet) = queues.get_mut(&port).and_then(VecDeque::pop_front) {
                return Some(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .ready
                .wait_timeout(queues, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queues = next;
        }
    }
}

#[derive(Default)]
struct Shared {
    faults: Mutex<HashMap<String, FaultPlan>>,
    builds: Mutex<HashMap<String, u64>>,
    descriptions: Mutex<HashMap<String, String>>,
    properties: Mutex<Vec<PropertySet>>,
    live: Mutex<HashMap<String, Weak<SimPipeline>>>,
    network: Arc<Loopback>,
}

impl Shared {
    fn faults_for(&self, name: &str) -> FaultPlan {
        lock(&self.faults).get(name).cloned().unwrap_or_default()
    }

    fn with_faults(&self, name: &str, change: impl FnOnce(&mut FaultPlan)) {
        change(lock(&self.faults).entry(name.to_string()).or_default());
    }

    fn live(&self, name: &str) -> Option<Arc<SimPipeline>> {
        lock(&self.live).get(name).and_then(Weak::upgrade)
    }
}

/// Media backend running entirely in this process
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
    frames: bool,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            frames: true,
        }
    }

    /// Whether playing pipelines generate frames
    pub fn with_frames(mut self, frames: bool) -> Self {
        self.frames = frames;
        self
    }

    /// Fail the next `count` builds of `pipeline`
    pub fn fail_builds(&self, pipeline: &str, count: u32) {
        self.shared.with_faults(pipeline, |f| f.fail_builds = count);
    }

    /// Refuse the next `count` transitions of `pipeline` to playing
    pub fn fail_plays(&self, pipeline: &str, count: u32) {
        self.shared.with_faults(pipeline, |f| f.fail_plays = count);
    }

    pub fn reject_properties(&self, pipeline: &str, reject: bool) {
        self.shared.with_faults(pipeline, |f| f.reject_properties = reject);
    }

    /// Make the stop transition of `pipeline` time out
    pub fn hang_on_stop(&self, pipeline: &str, hang: bool) {
        self.shared.with_faults(pipeline, |f| f.hang_on_stop = hang);
    }

    /// Post a bus event on the live pipeline named `pipeline`
    pub fn inject(&self, pipeline: &str, event: BusEvent) -> bool {
        match self.shared.live(pipeline) {
            Some(sim) => {
                sim.post(event);
                true
            }
            None => false,
        }
    }

    pub fn build_count(&self, pipeline: &str) -> u64 {
        lock(&self.shared.builds).get(pipeline).copied().unwrap_or(0)
    }

    pub fn last_description(&self, pipeline: &str) -> Option<String> {
        lock(&self.shared.descriptions).get(pipeline).cloned()
    }

    pub fn properties(&self) -> Vec<PropertySet> {
        lock(&self.shared.properties).clone()
    }

    pub fn is_playing(&self, pipeline: &str) -> bool {
        self.shared
            .live(pipeline)
            .is_some_and(|sim| sim.playing.load(Ordering::SeqCst))
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for SimulatedBackend {
    fn build(&self, name: &str, description: &str) -> Result<Arc<dyn PipelineHandle>, BackendError> {
        let mut refuse = false;
        self.shared.with_faults(name, |f| {
            if f.fail_builds > 0 {
                f.fail_builds -= 1;
                refuse = true;
            }
        });
        if refuse {
            return Err(BackendError::Parse("simulated build failure".into()));
        }

        let parsed = parse(description)?;
        debug!(
            "Simulated pipeline {} built: {} checkpoints, port {:?}, {} fps",
            name,
            parsed.checkpoints.len(),
            parsed.port,
            parsed.fps
        );

        *lock(&self.shared.builds).entry(name.to_string()).or_default() += 1;
        lock(&self.shared.descriptions).insert(name.to_string(), description.to_string());

        let sim = Arc::new(SimPipeline {
            name: name.to_string(),
            parsed,
            shared: self.shared.clone(),
            frames: self.frames,
            events: Mutex::new(VecDeque::new()),
            event_posted: Condvar::new(),
            observers: Arc::new(Mutex::new(Vec::new())),
            playing: AtomicBool::new(false),
            worker_stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });
        lock(&self.shared.live).insert(name.to_string(), Arc::downgrade(&sim));

        Ok(sim)
    }
}

type Observers = Arc<Mutex<Vec<(String, Arc<dyn CheckpointObserver>)>>>;

struct SimPipeline {
    name: String,
    parsed: ParsedPipeline,
    shared: Arc<Shared>,
    frames: bool,
    events: Mutex<VecDeque<BusEvent>>,
    event_posted: Condvar,
    observers: Observers,
    playing: AtomicBool,
    worker_stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimPipeline {
    fn post(&self, event: BusEvent) {
        lock(&self.events).push_back(event);
        self.event_posted.notify_all();
    }

    fn start_worker(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() || !self.frames {
            return;
        }
        self.worker_stop.store(false, Ordering::SeqCst);

        let generator = FrameGenerator {
            checkpoints: self.parsed.checkpoints.clone(),
            observers: self.observers.clone(),
            stop: self.worker_stop.clone(),
            network: self.shared.network.clone(),
            port: self.parsed.port,
            fps: self.parsed.fps.max(1),
        };
        let receiver = self.parsed.receiver;
        let spawned = thread::Builder::new()
            .name(format!("sim-{}", self.name))
            .spawn(move || {
                if receiver {
                    generator.run_receiver()
                } else {
                    generator.run_sender()
                }
            });

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => warn!("Simulated pipeline {}: cannot start frame thread: {}", self.name, e),
        }
    }

    fn stop_worker(&self) {
        self.worker_stop.store(true, Ordering::SeqCst);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for SimPipeline {
    fn drop(&mut self) {
        self.worker_stop.store(true, Ordering::SeqCst);
    }
}

impl PipelineHandle for SimPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_state(&self, target: TargetState, timeout: Duration) -> Result<(), BackendError> {
        match target {
            TargetState::Playing => {
                let mut refuse = false;
                self.shared.with_faults(&self.name, |f| {
                    if f.fail_plays > 0 {
                        f.fail_plays -= 1;
                        refuse = true;
                    }
                });
                if refuse {
                    return Err(BackendError::StateChange {
                        target,
                        reason: "simulated refusal".into(),
                    });
                }
                self.playing.store(true, Ordering::SeqCst);
                self.start_worker();
                Ok(())
            }
            TargetState::Null => {
                if self.shared.faults_for(&self.name).hang_on_stop {
                    return Err(BackendError::Timeout { target, timeout });
                }
                self.stop_worker();
                self.playing.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn poll_event(&self, timeout: Duration) -> Option<BusEvent> {
        let mut events = lock(&self.events);
        if let Some(event) = events.pop_front() {
            return Some(event);
        }
        let (mut events, _) = self
            .event_posted
            .wait_timeout(events, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        events.pop_front()
    }

    fn set_property(&self, element: &str, key: &str, value: PropertyValue) -> Result<(), BackendError> {
        if !self.parsed.elements.iter().any(|e| e == element) {
            return Err(BackendError::NoSuchElement(element.to_string()));
        }
        if self.shared.faults_for(&self.name).reject_properties {
            return Err(BackendError::Property {
                element: element.to_string(),
                key: key.to_string(),
                reason: "simulated rejection".into(),
            });
        }

        lock(&self.shared.properties).push(PropertySet {
            pipeline: self.name.clone(),
            element: element.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn on_checkpoint(&self, checkpoint: &str, observer: Arc<dyn CheckpointObserver>) -> Result<(), BackendError> {
        if !self.parsed.checkpoints.iter().any(|(name, _)| name == checkpoint) {
            return Err(BackendError::NoSuchElement(checkpoint.to_string()));
        }
        lock(&self.observers).push((checkpoint.to_string(), observer));
        Ok(())
    }
}

struct FrameGenerator {
    checkpoints: Vec<(String, Payload)>,
    observers: Observers,
    stop: Arc<AtomicBool>,
    network: Arc<Loopback>,
    port: Option<u16>,
    fps: u32,
}

impl FrameGenerator {
    fn targets(&self, checkpoint: &str) -> Vec<Arc<dyn CheckpointObserver>> {
        lock(&self.observers)
            .iter()
            .filter(|(name, _)| name == checkpoint)
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run_sender(self) {
        let interval = Duration::from_secs(1) / self.fps;
        let mut sequence: u16 = 0;
        let mut frame: u32 = 0;

        while !self.stopped() {
            let started = Instant::now();

            for (checkpoint, payload) in &self.checkpoints {
                let targets = self.targets(checkpoint);
                match payload {
                    Payload::Media => {
                        thread::sleep(STAGE_WORK);
                        for target in &targets {
                            target.on_checkpoint(checkpoint, BufferView::Media);
                        }
                    }
                    Payload::Packet => {
                        for index in 0..PACKETS_PER_FRAME {
                            let mut header = Header {
                                version: 2,
                                marker: index + 1 == PACKETS_PER_FRAME,
                                payload_type: 96,
                                sequence_number: sequence,
                                timestamp: frame.wrapping_mul(90_000 / self.fps),
                                ssrc: SSRC,
                                ..Default::default()
                            };
                            sequence = sequence.wrapping_add(1);
                            for target in &targets {
                                target.on_checkpoint(checkpoint, BufferView::OutgoingPacket(&mut header));
                            }
                            self.transmit(header);
                        }
                    }
                }
            }

            frame = frame.wrapping_add(1);
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    fn transmit(&self, header: Header) {
        let Some(port) = self.port else { return };
        let packet = Packet {
            header,
            payload: Bytes::from_static(&[0u8; 64]),
        };
        match packet.marshal() {
            Ok(raw) => self.network.push(port, raw),
            Err(e) => debug!("Simulated packet dropped: {}", e),
        }
    }

    fn run_receiver(self) {
        let Some(port) = self.port else {
            while !self.stopped() {
                thread::sleep(Duration::from_millis(20));
            }
            return;
        };

        while !self.stopped() {
            let Some(mut raw) = self.network.pop(port, Duration::from_millis(20)) else {
                continue;
            };
            let Ok(packet) = Packet::unmarshal(&mut raw) else {
                continue;
            };

            for (checkpoint, payload) in &self.checkpoints {
                if *payload != Payload::Packet {
                    continue;
                }
                for target in self.targets(checkpoint) {
                    target.on_checkpoint(checkpoint, BufferView::IncomingPacket(&packet.header));
                }
            }

            if !packet.header.marker {
                continue;
            }
            for (checkpoint, payload) in &self.checkpoints {
                if *payload != Payload::Media {
                    continue;
                }
                thread::sleep(STAGE_WORK);
                for target in self.targets(checkpoint) {
                    target.on_checkpoint(checkpoint, BufferView::Media);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::pipeline::description::{self, Platform};
    use crate::pipeline::types::{StreamRole, StreamSide};

    #[derive(Default)]
    struct Counter {
        hits: Mutex<HashMap<String, usize>>,
    }

    impl Counter {
        fn get(&self, checkpoint: &str) -> usize {
            lock(&self.hits).get(checkpoint).copied().unwrap_or(0)
        }
    }

    impl CheckpointObserver for Counter {
        fn on_checkpoint(&self, checkpoint: &str, _buffer: BufferView<'_>) {
            *lock(&self.hits).entry(checkpoint.to_string()).or_default() += 1;
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_parse_sender_description() {
        let text = description::describe(
            StreamRole::Sender,
            Platform::Desktop,
            &StreamConfig::default(),
            StreamSide::Left,
        )
        .unwrap();
        let parsed = parse(&text).unwrap();

        assert!(!parsed.receiver);
        assert_eq!(parsed.port, Some(8554));
        assert_eq!(parsed.fps, 60);
        assert!(parsed.elements.iter().any(|e| e == "encoder"));
        assert_eq!(
            parsed.checkpoints,
            vec![
                ("camsrc_ident".to_string(), Payload::Media),
                ("vidconv_ident".to_string(), Payload::Media),
                ("enc_ident".to_string(), Payload::Media),
                ("rtppay_ident".to_string(), Payload::Packet),
            ]
        );
    }

    #[test]
    fn test_parse_receiver_description() {
        let text = description::describe(
            StreamRole::Receiver,
            Platform::Desktop,
            &StreamConfig::default(),
            StreamSide::Right,
        )
        .unwrap();
        let parsed = parse(&text).unwrap();

        assert!(parsed.receiver);
        assert_eq!(parsed.port, Some(8556));
        assert_eq!(parsed.checkpoints[0], ("udpsrc_ident".to_string(), Payload::Packet));
        assert!(parsed.checkpoints[1..].iter().all(|(_, p)| *p == Payload::Media));

        assert!(parse("videotestsrc ! ! fakesink").is_err());
    }

    #[test]
    fn test_fault_injection() {
        let backend = SimulatedBackend::new().with_frames(false);
        backend.fail_builds("a", 1);
        assert!(backend.build("a", "videotestsrc ! fakesink").is_err());

        let handle = backend.build("a", "videotestsrc ! jpegenc name=encoder ! fakesink").unwrap();
        assert_eq!(backend.build_count("a"), 1);

        backend.fail_plays("a", 1);
        assert!(handle.set_state(TargetState::Playing, Duration::from_secs(1)).is_err());
        assert!(handle.set_state(TargetState::Playing, Duration::from_secs(1)).is_ok());
        assert!(backend.is_playing("a"));

        assert!(backend.inject("a", BusEvent::EndOfStream));
        assert_eq!(handle.poll_event(Duration::from_millis(1)), Some(BusEvent::EndOfStream));
        assert_eq!(handle.poll_event(Duration::from_millis(1)), None);

        assert!(handle.set_property("encoder", "quality", PropertyValue::Int(50)).is_ok());
        assert_eq!(
            handle.set_property("nope", "quality", PropertyValue::Int(50)),
            Err(BackendError::NoSuchElement("nope".into()))
        );
        backend.reject_properties("a", true);
        assert!(handle.set_property("encoder", "quality", PropertyValue::Int(40)).is_err());
        assert_eq!(backend.properties().len(), 1);

        drop(handle);
        assert!(!backend.inject("a", BusEvent::EndOfStream));
    }

    #[test]
    fn test_packets_flow_from_sender_to_receiver() {
        let backend = SimulatedBackend::new();
        let config = StreamConfig::default();
        let counter = Arc::new(Counter::default());

        let sender = backend
            .build(
                "sender_left",
                &description::describe(StreamRole::Sender, Platform::Desktop, &config, StreamSide::Left).unwrap(),
            )
            .unwrap();
        let receiver = backend
            .build(
                "receiver_left",
                &description::describe(StreamRole::Receiver, Platform::Desktop, &config, StreamSide::Left).unwrap(),
            )
            .unwrap();
        sender.on_checkpoint("rtppay_ident", counter.clone()).unwrap();
        receiver.on_checkpoint("udpsrc_ident", counter.clone()).unwrap();
        receiver.on_checkpoint("vidflip_ident", counter.clone()).unwrap();

        receiver.set_state(TargetState::Playing, Duration::from_secs(1)).unwrap();
        sender.set_state(TargetState::Playing, Duration::from_secs(1)).unwrap();

        assert!(wait_until(Duration::from_secs(3), || counter.get("vidflip_ident") >= 2));
        sender.set_state(TargetState::Null, Duration::from_secs(1)).unwrap();
        receiver.set_state(TargetState::Null, Duration::from_secs(1)).unwrap();

        assert!(counter.get("rtppay_ident") >= PACKETS_PER_FRAME * 2);
        assert!(counter.get("udpsrc_ident") >= PACKETS_PER_FRAME * 2);
    }
}
