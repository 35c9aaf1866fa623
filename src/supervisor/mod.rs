//! Per-stream pipeline supervision
//!
//! Every stream slot (role + side) is owned by one `PipelineSupervisor`
//! running on its own thread. It builds the pipeline for the current
//! configuration, watches it, applies cosmetic changes in place, rebuilds on
//! structural changes or failures, and backs off when failures pile up. One
//! slot failing never touches another slot.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info, warn};

use crate::config::{Settings, StreamConfig, SupervisorTimings};
use crate::control::ConfigChannel;
use crate::pipeline::backend::{MediaBackend, PipelineHandle, TargetState};
use crate::pipeline::clock::StageClock;
use crate::pipeline::description::{self, ENCODER_ELEMENT, Platform};
use crate::pipeline::health::StreamHealth;
use crate::pipeline::state::SupervisorState;
use crate::pipeline::types::{StreamId, StreamSide};
use crate::telemetry::{FrameIdAssigner, Telemetry};
use crate::utils::sos::SignalOfStop;

pub mod error;
pub mod registry;
pub mod retry;

use error::{BuildError, DynamicUpdateError, StartError, StateTransitionError, StreamingError};
use registry::HandleRegistry;
use retry::{FailureState, RetryDecision, RetryPolicy};

/// Process-wide collaborators shared by all supervisors
#[derive(Clone)]
pub struct Environment {
    pub backend: Arc<dyn MediaBackend>,
    pub channel: ConfigChannel,
    pub registry: HandleRegistry,
    pub sos: SignalOfStop,
    pub clock: Arc<dyn StageClock>,
    pub frame_ids: Arc<FrameIdAssigner>,
    /// Subscribe latency telemetry to the checkpoints of every pipeline
    pub telemetry: bool,
}

/// A running supervisor thread
pub struct SupervisorHandle {
    pub id: StreamId,
    pub health: Arc<StreamHealth>,
    pub thread: JoinHandle<()>,
}

/// Start one supervisor per side for every role in `settings`
pub fn spawn_all(settings: &Settings, env: &Environment) -> anyhow::Result<Vec<SupervisorHandle>> {
    let mut handles = Vec::new();
    for role in settings.role.roles() {
        for side in StreamSide::ALL {
            let id = StreamId::new(*role, side);
            let health = Arc::new(StreamHealth::new());

            let mut supervisor = PipelineSupervisor::new(id, settings, env, health.clone());
            if env.telemetry {
                let telemetry = Telemetry::for_stream(
                    id,
                    env.clock.clone(),
                    env.frame_ids.clone(),
                    health.clone(),
                    settings.benchmark.as_ref(),
                )
                .with_context(|| format!("cannot set up telemetry for {}", id))?;
                supervisor = supervisor.with_telemetry(telemetry);
            }

            let thread = supervisor
                .spawn()
                .with_context(|| format!("cannot start supervisor thread for {}", id))?;
            handles.push(SupervisorHandle { id, health, thread });
        }
    }
    Ok(handles)
}

enum Exit {
    Stop,
    Failed(StreamingError),
    Rebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stop,
    NewVersion,
    Elapsed,
}

pub struct PipelineSupervisor {
    id: StreamId,
    platform: Platform,
    timings: SupervisorTimings,
    retry: RetryPolicy,
    backend: Arc<dyn MediaBackend>,
    channel: ConfigChannel,
    registry: HandleRegistry,
    sos: SignalOfStop,
    health: Arc<StreamHealth>,
    telemetry: Option<Telemetry>,
    state: SupervisorState,
    failures: FailureState,
    current: StreamConfig,
    seen_version: u64,
    started: bool,
}

impl PipelineSupervisor {
    pub fn new(id: StreamId, settings: &Settings, env: &Environment, health: Arc<StreamHealth>) -> Self {
        Self {
            id,
            platform: settings.platform,
            timings: settings.timings.clone(),
            retry: settings.retry.clone(),
            backend: env.backend.clone(),
            channel: env.channel.clone(),
            registry: env.registry.clone(),
            sos: env.sos.clone(),
            health,
            telemetry: None,
            state: SupervisorState::Idle,
            failures: FailureState::default(),
            current: StreamConfig::default(),
            seen_version: 0,
            started: false,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("[{}] Supervisor started", self.id);
        let mut pending: Option<(u64, StreamConfig)> = None;

        while !self.sos.cancelled() {
            let (version, config) = match pending.take().or_else(|| self.wait_for_config()) {
                Some(next) => next,
                None => break,
            };

            // Staggered first start keeps the camera drivers from contending
            if !self.started {
                self.started = true;
                if !self.id.side().is_primary() && self.sos.wait_timeout(self.timings.right_stagger) {
                    break;
                }
            }

            self.seen_version = version;
            self.transition(SupervisorState::Building);
            let handle = match self.start(&config) {
                Ok(handle) => handle,
                Err(e) => {
                    error!("[{}] {}", self.id, e);
                    self.health.record_build_failure();
                    if !self.back_off() {
                        break;
                    }
                    continue;
                }
            };
            self.current = config;

            match self.monitor(&handle) {
                Exit::Stop => {
                    self.stop(handle);
                    break;
                }
                Exit::Failed(e) => {
                    error!("[{}] Streaming failed: {}", self.id, e);
                    self.health.record_streaming_failure();
                    self.stop(handle);
                    if !self.back_off() {
                        break;
                    }
                }
                Exit::Rebuild => {
                    self.health.record_planned_rebuild();
                    self.stop(handle);
                    if self.sos.wait_timeout(self.timings.settle_delay) {
                        break;
                    }
                    let side = self.id.side();
                    pending = self
                        .channel
                        .snapshot()
                        .filter(|(_, config)| config.side_enabled(side));
                }
            }
        }

        self.transition(SupervisorState::Terminated);
        info!("[{}] Supervisor terminated", self.id);
    }

    fn transition(&mut self, next: SupervisorState) {
        if !self.state.can_transition_to(&next) {
            warn!("[{}] Unexpected transition {} -> {}", self.id, self.state, next);
        }
        if self.state.description() != next.description() {
            debug!("[{}] {} -> {}", self.id, self.state, next);
        }
        self.state = next;
        self.health.set_state(next);
    }

    /// Idle until a configuration exists that enables this side
    fn wait_for_config(&mut self) -> Option<(u64, StreamConfig)> {
        self.transition(SupervisorState::Idle);
        let mut announced = None;

        loop {
            if self.sos.cancelled() {
                return None;
            }

            let Some((version, config)) = self.channel.snapshot() else {
                if self.sos.wait_timeout(self.timings.poll_interval) {
                    return None;
                }
                continue;
            };

            if config.side_enabled(self.id.side()) {
                return Some((version, config));
            }

            if announced != Some(version) {
                info!("[{}] Mono mode, {} camera stays idle", self.id, self.id.side());
                announced = Some(version);
                self.seen_version = version;
                self.current = config;
            }
            if self.sleep_unless(self.timings.mono_idle, version) == Wake::Stop {
                return None;
            }
        }
    }

    /// Sleep in poll-sized chunks, waking early on stop or a version other than `seen`
    fn sleep_unless(&self, total: Duration, seen: u64) -> Wake {
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wake::Elapsed;
            }
            let chunk = (deadline - now).min(self.timings.poll_interval);
            if self.sos.wait_timeout(chunk) {
                return Wake::Stop;
            }
            if self.channel.version() != seen {
                return Wake::NewVersion;
            }
        }
    }

    /// Count a failure and wait as the retry policy says; `false` means stop
    fn back_off(&mut self) -> bool {
        self.transition(SupervisorState::Idle);
        let failures = self.failures.record_failure();
        self.health.set_consecutive_failures(failures);

        match self.retry.decide(failures) {
            RetryDecision::Backoff(delay) => {
                warn!(
                    "[{}] Failure {}/{}, retrying in {:?}",
                    self.id, failures, self.retry.max_retries, delay
                );
                self.sleep_unless(delay, self.seen_version) != Wake::Stop
            }
            RetryDecision::Cooldown(delay) => {
                error!(
                    "[{}] {} consecutive failures, cooling down for {:?}",
                    self.id, failures, delay
                );
                self.failures.set_cooling_down(true);

                // No rebuild until a new configuration shows up
                while self.failures.is_cooling_down() {
                    match self.sleep_unless(delay, self.seen_version) {
                        Wake::Stop => return false,
                        Wake::NewVersion => {
                            let forgiven = self.failures.reset();
                            self.health.set_consecutive_failures(0);
                            info!(
                                "[{}] New configuration during cooldown, forgetting {} failures",
                                self.id, forgiven
                            );
                        }
                        Wake::Elapsed => {
                            debug!("[{}] Still cooling down, waiting for a new configuration", self.id);
                        }
                    }
                }
                true
            }
        }
    }

    fn start(&mut self, config: &StreamConfig) -> Result<Arc<dyn PipelineHandle>, StartError> {
        let text = description::describe(self.id.role(), self.platform, config, self.id.side())
            .map_err(BuildError::from)?;
        debug!("[{}] Pipeline description: {}", self.id, text);

        let handle = self
            .backend
            .build(&self.id.pipeline_name(), &text)
            .map_err(BuildError::Backend)?;
        self.health.record_build();

        if let Err(e) = self.subscribe(&handle) {
            self.stop(handle);
            return Err(e.into());
        }
        self.registry.register(self.id, handle.clone());

        self.transition(SupervisorState::Playing);
        if let Err(source) = handle.set_state(TargetState::Playing, self.timings.stop_timeout) {
            self.stop(handle);
            return Err(StateTransitionError {
                stream: self.id,
                source,
            }
            .into());
        }

        info!(
            "[{}] Playing {} {}x{}@{} to port {}",
            self.id,
            config.codec,
            config.width,
            config.height,
            config.fps,
            config.port_for(self.id.side())
        );
        Ok(handle)
    }

    fn subscribe(&self, handle: &Arc<dyn PipelineHandle>) -> Result<(), BuildError> {
        let Some(telemetry) = &self.telemetry else {
            return Ok(());
        };
        for &checkpoint in &telemetry.checkpoints {
            handle
                .on_checkpoint(checkpoint, telemetry.observer.clone())
                .map_err(|source| BuildError::Subscribe {
                    checkpoint,
                    source,
                })?;
        }
        Ok(())
    }

    /// Bring the pipeline to null and release it, whatever the outcome
    fn stop(&mut self, handle: Arc<dyn PipelineHandle>) {
        self.transition(SupervisorState::Stopping);
        if let Err(e) = handle.set_state(TargetState::Null, self.timings.stop_timeout) {
            warn!("[{}] {}; releasing pipeline anyway", self.id, e);
        }
        self.registry.unregister(self.id);
        drop(handle);
        debug!("[{}] Pipeline released", self.id);
    }

    fn monitor(&mut self, handle: &Arc<dyn PipelineHandle>) -> Exit {
        let since = Instant::now();
        self.transition(SupervisorState::Monitoring { since });
        let mut last_summary = Instant::now();

        loop {
            if let Some(event) = handle.poll_event(self.timings.poll_interval) {
                return Exit::Failed(event.into());
            }
            if self.sos.cancelled() {
                return Exit::Stop;
            }

            // A full poll window without events counts as recovered
            if self.failures.count() > 0 {
                let recovered = self.failures.reset();
                self.health.set_consecutive_failures(0);
                info!("[{}] Recovered after {} failures", self.id, recovered);
            }

            if self.channel.version() != self.seen_version {
                if let Some((version, config)) = self.channel.snapshot() {
                    if let Some(exit) = self.reconfigure(handle, version, config, since) {
                        return exit;
                    }
                }
            }

            if last_summary.elapsed() >= self.timings.health_log_interval {
                last_summary = Instant::now();
                self.log_health();
            }
        }
    }

    /// Apply a new configuration in place when possible; `Some` ends monitoring
    fn reconfigure(
        &mut self,
        handle: &Arc<dyn PipelineHandle>,
        version: u64,
        config: StreamConfig,
        since: Instant,
    ) -> Option<Exit> {
        if !config.side_enabled(self.id.side()) {
            info!("[{}] Mono mode (version {}), stopping {} camera", self.id, version, self.id.side());
            self.transition(SupervisorState::Rebuilding);
            return Some(Exit::Rebuild);
        }

        if !self.current.can_update_live(&config) {
            info!("[{}] Structural change (version {}), rebuilding", self.id, version);
            self.transition(SupervisorState::Rebuilding);
            return Some(Exit::Rebuild);
        }

        self.transition(SupervisorState::DynamicUpdate);
        match self.update_live(handle, &config) {
            Ok(()) => {
                info!(
                    "[{}] Live update applied (version {}): quality {}, bitrate {}",
                    self.id, version, config.encoding_quality, config.bitrate
                );
                self.health.record_live_update();
                self.current = config;
                self.seen_version = version;
                self.transition(SupervisorState::Monitoring { since });
                None
            }
            Err(e) => {
                warn!("[{}] Live update failed: {}; rebuilding", self.id, e);
                self.transition(SupervisorState::Rebuilding);
                Some(Exit::Rebuild)
            }
        }
    }

    fn update_live(&self, handle: &Arc<dyn PipelineHandle>, config: &StreamConfig) -> Result<(), DynamicUpdateError> {
        if let Some((key, value)) = description::live_property(self.id.role(), self.platform, config)? {
            handle.set_property(ENCODER_ELEMENT, key, value)?;
        }
        Ok(())
    }

    fn log_health(&self) {
        info!("[{}] {}", self.id, self.health.summary());
        if let Some(uptime) = self.state.monitoring_duration() {
            debug!("[{}] Pipeline up for {:?}", self.id, uptime);
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.stats.log_summary();
            if self.health.is_stalled(self.timings.health_log_interval) {
                warn!(
                    "[{}] No complete frame in the last {:?}",
                    self.id, self.timings.health_log_interval
                );
            }
        }
    }
}
