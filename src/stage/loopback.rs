//! Software stage backend.
//!
//! Every stage passes its input through to its downstreams and delivery sink
//! unchanged (encoders only retag the buffer as compressed video). Capture
//! stages can run a generator thread that produces synthetic frames at the
//! configured rate. The backend keeps a handle to every stage it created so
//! tests can push buffers and events by hand, inspect recorded controls, and
//! inject failures.

use super::{Stage, StageChain, StageControl, StageFactory, StageId};
use crate::buffer::{BufferAllocator, BufferKind, CodecFlags, MediaBuffer};
use crate::channel::{ChannelConfig, ChannelId};
use crate::delivery::DeliverySink;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{ChannelEvent, EventSink};
use crate::format::ImageInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Frames between synthetic motion events while motion detection is on.
const MOTION_EVENT_INTERVAL: u64 = 30;

#[derive(Default)]
struct Faults {
    create: Option<(ErrorCode, u32)>,
    bind: bool,
}

struct BackendInner {
    allocator: BufferAllocator,
    generate: bool,
    faults: Mutex<Faults>,
    stages: Mutex<HashMap<ChannelId, Vec<Weak<LoopbackStage>>>>,
    created: AtomicU64,
}

/// Software [`StageFactory`].
#[derive(Clone)]
pub struct LoopbackBackend {
    inner: Arc<BackendInner>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    /// Backend whose capture stages stay idle until fed by hand.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Backend whose capture stages generate frames on their own.
    pub fn with_generator() -> Self {
        Self::build(true)
    }

    fn build(generate: bool) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                allocator: BufferAllocator::new(),
                generate,
                faults: Mutex::new(Faults::default()),
                stages: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Allocator used by generator threads.
    pub fn allocator(&self) -> &BufferAllocator {
        &self.inner.allocator
    }

    /// Make the next `times` calls to `create` fail with `code`.
    pub fn fail_next_create(&self, code: ErrorCode, times: u32) {
        self.inner.faults.lock().unwrap().create = Some((code, times));
    }

    /// Make the next `Stage::bind` on any stage of this backend fail.
    pub fn fail_next_bind(&self) {
        self.inner.faults.lock().unwrap().bind = true;
    }

    /// Number of stage chains created so far.
    pub fn created_count(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Output stage of a channel, while it exists.
    pub fn stage(&self, channel: ChannelId) -> Option<Arc<LoopbackStage>> {
        let stages = self.inner.stages.lock().unwrap();
        stages.get(&channel)?.last()?.upgrade()
    }

    /// Every live stage of a channel, head to tail.
    pub fn chain(&self, channel: ChannelId) -> Vec<Arc<LoopbackStage>> {
        let stages = self.inner.stages.lock().unwrap();
        stages
            .get(&channel)
            .map(|chain| chain.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Produce `buffer` on a channel's output as if the stage made it.
    pub fn emit(&self, channel: ChannelId, buffer: MediaBuffer) -> Result<()> {
        let stage = self
            .stage(channel)
            .ok_or_else(|| Error::NotReady(format!("{} has no stage", channel)))?;
        stage.emit(buffer);
        Ok(())
    }

    /// Raise an event on a channel's output stage.
    pub fn emit_event(&self, channel: ChannelId, event: ChannelEvent) -> Result<()> {
        let stage = self
            .stage(channel)
            .ok_or_else(|| Error::NotReady(format!("{} has no stage", channel)))?;
        stage.emit_event(event);
        Ok(())
    }

    fn take_create_fault(&self) -> Option<ErrorCode> {
        let mut faults = self.inner.faults.lock().unwrap();
        let (code, times) = faults.create?;
        faults.create = if times > 1 {
            Some((code, times - 1))
        } else {
            None
        };
        Some(code)
    }

    fn new_stage(&self, channel: ChannelId, name: String, config: &ChannelConfig) -> Arc<LoopbackStage> {
        Arc::new(LoopbackStage {
            id: StageId::new(),
            name,
            channel,
            input_slots: config.input_slots(),
            config: Mutex::new(config.clone()),
            backend: Arc::downgrade(&self.inner),
            state: Mutex::new(StageState::default()),
            running: AtomicBool::new(true),
            frames: AtomicU64::new(0),
            generator: Mutex::new(None),
        })
    }
}

impl StageFactory for LoopbackBackend {
    fn create(&self, id: ChannelId, config: &ChannelConfig) -> Result<StageChain> {
        if let Some(code) = self.take_create_fault() {
            return Err(code.into_error(format!("injected create failure on {}", id)));
        }
        if config.kind() != id.kind {
            return Err(Error::InvalidArgument(format!(
                "{} config for {} channel",
                config.kind(),
                id
            )));
        }

        let stages: Vec<Arc<LoopbackStage>> = match config {
            ChannelConfig::Encode(enc) if enc.is_snapshot_chain() => {
                let scale = self.new_stage(id, format!("{}-scale", id), config);
                let jpeg = self.new_stage(id, format!("{}-jpeg", id), config);
                scale.link(jpeg.clone(), 0);
                vec![scale, jpeg]
            }
            _ => vec![self.new_stage(id, id.to_string(), config)],
        };

        if self.inner.generate && id.kind.is_capture() {
            for stage in &stages {
                stage.start_generator(self.inner.allocator.clone())?;
            }
        }

        self.inner
            .stages
            .lock()
            .unwrap()
            .insert(id, stages.iter().map(Arc::downgrade).collect());
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %id, stages = stages.len(), "loopback stages created");

        Ok(StageChain::from_stages(
            stages.into_iter().map(|s| s as Arc<dyn Stage>),
        ))
    }
}

#[derive(Default)]
struct StageState {
    downstreams: Vec<(Arc<dyn Stage>, u32)>,
    delivery: Option<Arc<dyn DeliverySink>>,
    events: Option<Arc<dyn EventSink>>,
    controls: Vec<StageControl>,
    inputs: u64,
    force_idr: bool,
}

/// One software stage.
pub struct LoopbackStage {
    id: StageId,
    name: String,
    channel: ChannelId,
    input_slots: u32,
    config: Mutex<ChannelConfig>,
    backend: Weak<BackendInner>,
    state: Mutex<StageState>,
    running: AtomicBool,
    frames: AtomicU64,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackStage {
    /// Channel this stage belongs to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Produce a buffer: fan out to downstreams, then hand to the sink.
    pub fn emit(&self, mut buffer: MediaBuffer) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        buffer.set_origin(self.channel);
        self.frames.fetch_add(1, Ordering::Relaxed);

        let (downstreams, delivery) = {
            let state = self.state.lock().unwrap();
            (state.downstreams.clone(), state.delivery.clone())
        };

        for (downstream, slot) in &downstreams {
            if let Err(e) = downstream.input(buffer.share(), *slot) {
                trace!(stage = %self.name, downstream = %downstream.name(), error = %e, "downstream refused buffer");
            }
        }
        match delivery {
            Some(sink) => sink.deliver(buffer),
            None => trace!(stage = %self.name, "no delivery sink, releasing"),
        }
    }

    /// Raise an event through the installed event sink.
    pub fn emit_event(&self, event: ChannelEvent) {
        let sink = self.state.lock().unwrap().events.clone();
        if let Some(sink) = sink {
            sink.on_event(&event);
        }
    }

    /// Controls applied so far, oldest first.
    pub fn controls(&self) -> Vec<StageControl> {
        self.state.lock().unwrap().controls.clone()
    }

    /// Number of bound downstreams.
    pub fn downstream_count(&self) -> usize {
        self.state.lock().unwrap().downstreams.len()
    }

    /// Buffers received on any input slot.
    pub fn input_count(&self) -> u64 {
        self.state.lock().unwrap().inputs
    }

    /// Buffers produced.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Whether a delivery sink is installed.
    pub fn has_delivery_sink(&self) -> bool {
        self.state.lock().unwrap().delivery.is_some()
    }

    /// Whether the stage is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn link(&self, downstream: Arc<dyn Stage>, slot: u32) {
        self.state.lock().unwrap().downstreams.push((downstream, slot));
    }

    fn start_generator(self: &Arc<Self>, allocator: BufferAllocator) -> Result<()> {
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("gen-{}", self.channel))
            .spawn(move || generate(weak, allocator))?;
        *self.generator.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Run the stage's own work on `buffer`.
    fn process(&self, mut buffer: MediaBuffer) -> Option<MediaBuffer> {
        let config = self.config.lock().unwrap().clone();
        match &config {
            ChannelConfig::Encode(enc) => {
                let force_idr = std::mem::take(&mut self.state.lock().unwrap().force_idr);
                let frame = self.frames.load(Ordering::Relaxed);
                buffer.set_kind(BufferKind::Video(CodecFlags {
                    codec: enc.codec,
                    key_frame: force_idr || frame % enc.gop as u64 == 0,
                    temporal_layer: 0,
                }));
                Some(buffer)
            }
            ChannelConfig::Mux(mux) => {
                let first = self.state.lock().unwrap().inputs == 1;
                if first {
                    self.emit_event(ChannelEvent::FileCreated {
                        path: mux.path.clone(),
                    });
                }
                None
            }
            ChannelConfig::Render(_) | ChannelConfig::AudioPlayback(_) => None,
            _ => Some(buffer),
        }
    }
}

fn generate(stage: Weak<LoopbackStage>, allocator: BufferAllocator) {
    let start = Instant::now();
    loop {
        let Some(stage) = stage.upgrade() else {
            return;
        };
        if !stage.is_running() {
            return;
        }

        let config = stage.config.lock().unwrap().clone();
        let (interval, buffer) = match &config {
            ChannelConfig::Capture(cfg) => (
                Duration::from_secs(1) / cfg.frame_rate.max(1),
                synthetic_frame(&allocator, cfg.image, stage.frame_count()),
            ),
            ChannelConfig::AudioCapture(cfg) => (
                Duration::from_secs_f64(cfg.info.nb_samples as f64 / cfg.info.sample_rate as f64),
                allocator.create_audio_buffer(cfg.info),
            ),
            _ => return,
        };

        match buffer {
            Ok(mut buffer) => {
                buffer.set_timestamp_us(start.elapsed().as_micros() as u64);
                stage.emit(buffer);
            }
            Err(e) => warn!(stage = %stage.name, error = %e, "generator allocation failed"),
        }

        if let ChannelConfig::Capture(cfg) = &config
            && let Some(motion) = &cfg.motion
            && stage.frame_count() % MOTION_EVENT_INTERVAL == 0
        {
            stage.emit_event(ChannelEvent::MotionDetected {
                region: motion.region,
            });
        }

        drop(stage);
        thread::sleep(interval);
    }
}

fn synthetic_frame(allocator: &BufferAllocator, image: ImageInfo, frame: u64) -> Result<MediaBuffer> {
    let mut buffer = allocator.create_image_buffer(image, false)?;
    let luma_len = image.hor_stride as usize * image.ver_stride as usize;
    let level = (frame % 220) as u8 + 16;
    let data = buffer.data_mut();
    let split = luma_len.min(data.len());
    data[..split].fill(level);
    data[split..].fill(128);
    Ok(buffer)
}

impl Stage for LoopbackStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, downstream: Arc<dyn Stage>, slot: u32) -> Result<()> {
        if let Some(backend) = self.backend.upgrade()
            && std::mem::take(&mut backend.faults.lock().unwrap().bind)
        {
            return Err(Error::NotReady(format!(
                "injected bind failure on {}",
                self.name
            )));
        }
        if !self.is_running() {
            return Err(Error::NotReady(format!("{} is shut down", self.name)));
        }

        let mut state = self.state.lock().unwrap();
        if state.downstreams.iter().any(|(d, _)| d.id() == downstream.id()) {
            return Err(Error::Busy(format!(
                "{} already feeds {}",
                self.name,
                downstream.name()
            )));
        }
        state.downstreams.push((downstream, slot));
        Ok(())
    }

    fn unbind(&self, downstream: StageId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let pos = state.downstreams.iter().position(|(d, _)| d.id() == downstream);
            pos.map(|pos| state.downstreams.remove(pos))
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::NotReady(format!(
                "{} does not feed {}",
                self.name, downstream
            ))),
        }
    }

    fn set_delivery_sink(&self, sink: Option<Arc<dyn DeliverySink>>) {
        let old = std::mem::replace(&mut self.state.lock().unwrap().delivery, sink);
        drop(old);
    }

    fn set_event_sink(&self, sink: Option<Arc<dyn EventSink>>) {
        let old = std::mem::replace(&mut self.state.lock().unwrap().events, sink);
        drop(old);
    }

    fn input(&self, buffer: MediaBuffer, slot: u32) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotReady(format!("{} is shut down", self.name)));
        }
        if slot >= self.input_slots {
            return Err(Error::InvalidArgument(format!(
                "{} has {} input slots, got slot {}",
                self.name, self.input_slots, slot
            )));
        }
        self.state.lock().unwrap().inputs += 1;

        if let Some(output) = self.process(buffer) {
            self.emit(output);
        }
        Ok(())
    }

    fn control(&self, control: &StageControl) -> Result<()> {
        self.config.lock().unwrap().apply(control)?;
        let mut state = self.state.lock().unwrap();
        if matches!(control, StageControl::ForceIdr) {
            state.force_idr = true;
        }
        state.controls.push(control.clone());
        Ok(())
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let generator = self.generator.lock().unwrap().take();
        if let Some(handle) = generator
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }

        let old = std::mem::take(&mut *self.state.lock().unwrap());
        drop(old);
        debug!(stage = %self.name, "loopback stage shut down");
    }
}

impl std::fmt::Debug for LoopbackStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackStage")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
