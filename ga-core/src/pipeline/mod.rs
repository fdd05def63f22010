//! Pipeline orchestration.
//!
//! ```text
//! [replay]   control channel ──► ControlReplay
//! [video]    VideoSource ──video-0──► ColorFilter ──filter-0──► VideoEncoder ─┐
//! [audio]    AudioSource ──audio-0──► AudioEncoder ───────────────────────────┤
//!                                                                   stream-0 ─┴─► TransportServer
//! ```
//!
//! Stages are created by kind through a [`StageRegistry`], then driven
//! through `load → initialize → start` in plan order. Any failure aborts
//! the launch; there is no partially running pipeline. Only a
//! [`RunningPipeline`] hands out the encoder and RTT handles the control
//! handlers need, so reconfiguration cannot race stage startup.

pub mod pipe;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bbr::RttSource;
use crate::error::GaError;
use crate::message::InputEvent;
use crate::reconfig::Reconfigurable;

pub use pipe::{PipeReceiver, PipeRegistry, PipeSender};

// ── StageKind / StagePhase ───────────────────────────────────────

/// Every kind of stage the orchestrator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    ControlReplay,
    VideoSource,
    ColorFilter,
    VideoEncoder,
    AudioSource,
    AudioEncoder,
    TransportServer,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::ControlReplay => "control-replay",
            StageKind::VideoSource => "video-source",
            StageKind::ColorFilter => "filter",
            StageKind::VideoEncoder => "video-encoder",
            StageKind::AudioSource => "audio-source",
            StageKind::AudioEncoder => "audio-encoder",
            StageKind::TransportServer => "transport-server",
        };
        f.write_str(name)
    }
}

/// Lifecycle step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Load,
    Init,
    Start,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePhase::Load => write!(f, "load"),
            StagePhase::Init => write!(f, "init"),
            StagePhase::Start => write!(f, "start"),
        }
    }
}

// ── Settings ─────────────────────────────────────────────────────

/// Capture rectangle in screen coordinates (right/bottom exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Non-empty with even dimensions (required by 4:2:0 chroma).
    pub fn validate(&self) -> Result<(), GaError> {
        if self.width() == 0 || self.height() == 0 {
            return Err(GaError::Config(format!("empty crop rectangle {self}")));
        }
        if self.width() % 2 != 0 || self.height() % 2 != 0 {
            return Err(GaError::Config(format!("crop rectangle {self} must have even size")));
        }
        Ok(())
    }

    /// Clip a point into the rectangle.
    pub fn clip(&self, x: i32, y: i32) -> (i32, i32) {
        let clamp = |v: i32, lo: u32, hi: u32| v.clamp(lo as i32, (hi as i32 - 1).max(lo as i32));
        (clamp(x, self.left, self.right), clamp(y, self.top, self.bottom))
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})-({},{})", self.left, self.top, self.right, self.bottom)
    }
}

/// Video capture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Initial encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub bitrate_kbps: u32,
    pub crf: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSettings {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// UDP address media is served from.
    pub bind: SocketAddr,
    /// Largest datagram the transport will send.
    pub mtu: usize,
}

/// Names of the inter-stage pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeNames {
    pub video: String,
    pub filter: String,
    pub audio: String,
    pub stream: String,
}

impl Default for PipeNames {
    fn default() -> Self {
        Self {
            video: "video-0".into(),
            filter: "filter-0".into(),
            audio: "audio-0".into(),
            stream: "stream-0".into(),
        }
    }
}

/// Everything stages read during initialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub crop: Option<CropRect>,
    pub video: VideoSettings,
    pub encoder: EncoderSettings,
    pub audio: AudioSettings,
    pub control_enabled: bool,
    pub transport: TransportSettings,
    pub pipes: PipeNames,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            crop: None,
            video: VideoSettings {
                width: 640,
                height: 360,
                fps: 30,
            },
            encoder: EncoderSettings {
                bitrate_kbps: crate::bbr::governor::DEFAULT_INITIAL_BITRATE_KBPS,
                crf: 23,
            },
            audio: AudioSettings {
                enabled: true,
                sample_rate: 48_000,
                channels: 2,
            },
            control_enabled: true,
            transport: TransportSettings {
                bind: SocketAddr::from(([0, 0, 0, 0], 8554)),
                mtu: 1400,
            },
            pipes: PipeNames::default(),
        }
    }
}

impl PipelineSettings {
    /// Frame size produced by the video source: the crop rectangle when
    /// set, the configured geometry otherwise.
    pub fn capture_size(&self) -> (u32, u32) {
        match self.crop {
            Some(rect) => (rect.width(), rect.height()),
            None => (self.video.width, self.video.height),
        }
    }
}

// ── Stage ────────────────────────────────────────────────────────

/// Handle to a stage's running task.
pub type StageTask = JoinHandle<()>;

/// What a stage sees while it initialises.
pub struct StageContext<'a> {
    pub settings: &'a PipelineSettings,
    pub pipes: &'a mut PipeRegistry,
    /// Cancelled when the pipeline stops.
    pub shutdown: CancellationToken,
}

/// One unit of the processing chain.
///
/// A stage is constructed idle, wires its pipes in [`initialize`], and
/// spawns its processing task in [`start`]. The capability accessors
/// expose optional control-plane handles; most stages have none.
///
/// [`initialize`]: Stage::initialize
/// [`start`]: Stage::start
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError>;

    /// Spawn the stage's task on the current Tokio runtime.
    fn start(&mut self) -> Result<StageTask, GaError>;

    /// Live reconfiguration entry point (video encoder).
    fn reconfigurer(&self) -> Option<Arc<dyn Reconfigurable>> {
        None
    }

    /// Latest-RTT query (transport server).
    fn rtt_source(&self) -> Option<Arc<dyn RttSource>> {
        None
    }

    /// Sink for replayed input events (control replay).
    fn input_sender(&self) -> Option<mpsc::Sender<InputEvent>> {
        None
    }
}

/// Spawn `task` on the current runtime, failing instead of panicking
/// when called outside one.
pub fn spawn_stage<F>(kind: StageKind, task: F) -> Result<StageTask, GaError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|e| GaError::Stage {
        stage: kind,
        phase: StagePhase::Start,
        reason: e.to_string(),
    })?;
    Ok(handle.spawn(task))
}

/// Error for a stage used before `initialize` succeeded.
pub fn not_initialized(kind: StageKind) -> GaError {
    GaError::Stage {
        stage: kind,
        phase: StagePhase::Start,
        reason: "stage not initialised".into(),
    }
}

// ── StageRegistry ────────────────────────────────────────────────

/// Constructor for a stage kind.
pub type StageFactory = Box<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Maps stage kinds to constructors.
#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<StageKind, StageFactory>,
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in stages.
    pub fn builtin() -> Self {
        use crate::stages::{
            AudioEncoder, ColorFilter, ControlReplay, PatternSource, ToneSource, TransportServer,
            VideoEncoder,
        };

        let mut registry = Self::new();
        registry.register(StageKind::ControlReplay, || Box::new(ControlReplay::new()));
        registry.register(StageKind::VideoSource, || Box::new(PatternSource::new()));
        registry.register(StageKind::ColorFilter, || Box::new(ColorFilter::new()));
        registry.register(StageKind::VideoEncoder, || Box::new(VideoEncoder::new()));
        registry.register(StageKind::AudioSource, || Box::new(ToneSource::new()));
        registry.register(StageKind::AudioEncoder, || Box::new(AudioEncoder::new()));
        registry.register(StageKind::TransportServer, || Box::new(TransportServer::new()));
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: StageKind, factory: F)
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Construct a stage of `kind`.
    pub fn load(&self, kind: StageKind) -> Result<Box<dyn Stage>, GaError> {
        let factory = self.factories.get(&kind).ok_or_else(|| GaError::Stage {
            stage: kind,
            phase: StagePhase::Load,
            reason: "no stage registered".into(),
        })?;
        let stage = factory();
        if stage.kind() != kind {
            return Err(GaError::Stage {
                stage: kind,
                phase: StagePhase::Load,
                reason: format!("factory produced a {} stage", stage.kind()),
            });
        }
        Ok(stage)
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────

/// A pipeline that has not been launched yet.
pub struct Pipeline {
    registry: StageRegistry,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(registry: StageRegistry, settings: PipelineSettings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Ordered stage list for this host.
    pub fn plan(&self) -> Vec<StageKind> {
        self.plan_with(!cfg!(target_os = "macos"))
    }

    /// Ordered stage list; `system_audio` says whether the platform can
    /// capture system audio at all.
    fn plan_with(&self, system_audio: bool) -> Vec<StageKind> {
        let mut plan = Vec::with_capacity(7);
        if self.settings.control_enabled {
            plan.push(StageKind::ControlReplay);
        }
        plan.extend([
            StageKind::VideoSource,
            StageKind::ColorFilter,
            StageKind::VideoEncoder,
        ]);
        if self.settings.audio.enabled {
            if system_audio {
                plan.push(StageKind::AudioSource);
            }
            plan.push(StageKind::AudioEncoder);
        }
        plan.push(StageKind::TransportServer);
        plan
    }

    /// Load, initialise and start every planned stage, in order.
    pub fn launch(self) -> Result<RunningPipeline, GaError> {
        let kinds = self.plan();
        let shutdown = CancellationToken::new();

        let result = self.launch_stages(&kinds, &shutdown);
        if let Err(e) = &result {
            error!("pipeline launch aborted: {e}");
            shutdown.cancel();
        }
        let (stages, tasks) = result?;

        info!(stages = stages.len(), "pipeline running");
        Ok(RunningPipeline {
            stages,
            tasks,
            shutdown,
        })
    }

    fn launch_stages(
        &self,
        kinds: &[StageKind],
        shutdown: &CancellationToken,
    ) -> Result<(Vec<Box<dyn Stage>>, Vec<StageTask>), GaError> {
        let mut stages = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            stages.push(self.registry.load(kind)?);
            info!(stage = %kind, "stage loaded");
        }

        let mut pipes = PipeRegistry::new();
        for stage in &mut stages {
            let kind = stage.kind();
            let mut ctx = StageContext {
                settings: &self.settings,
                pipes: &mut pipes,
                shutdown: shutdown.child_token(),
            };
            stage
                .initialize(&mut ctx)
                .map_err(|e| in_phase(kind, StagePhase::Init, e))?;
            info!(stage = %kind, "stage initialised");
        }

        let mut tasks = Vec::with_capacity(stages.len());
        for stage in &mut stages {
            let kind = stage.kind();
            tasks.push(stage.start().map_err(|e| in_phase(kind, StagePhase::Start, e))?);
            info!(stage = %kind, "stage started");
        }

        Ok((stages, tasks))
    }
}

/// Attach stage and phase to an error that does not carry them yet.
fn in_phase(stage: StageKind, phase: StagePhase, e: GaError) -> GaError {
    match e {
        GaError::Stage { .. } => e,
        other => GaError::Stage {
            stage,
            phase,
            reason: other.to_string(),
        },
    }
}

// ── RunningPipeline ──────────────────────────────────────────────

/// A fully started pipeline.
pub struct RunningPipeline {
    stages: Vec<Box<dyn Stage>>,
    tasks: Vec<StageTask>,
    shutdown: CancellationToken,
}

impl RunningPipeline {
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// The video encoder's reconfiguration entry point.
    pub fn encoder(&self) -> Option<Arc<dyn Reconfigurable>> {
        self.stages
            .iter()
            .filter(|s| s.kind() == StageKind::VideoEncoder)
            .find_map(|s| s.reconfigurer())
    }

    /// The transport's latest-RTT query.
    pub fn rtt_source(&self) -> Option<Arc<dyn RttSource>> {
        self.stages.iter().find_map(|s| s.rtt_source())
    }

    /// Where control-channel input events go, if replay is running.
    pub fn input_sender(&self) -> Option<mpsc::Sender<InputEvent>> {
        self.stages.iter().find_map(|s| s.input_sender())
    }

    /// Token cancelled when the pipeline stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every stage and wait for their tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("stage task ended abnormally: {e}");
            }
        }
        info!("pipeline stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Stage that records lifecycle calls and can be told to fail.
    struct ProbeStage {
        kind: StageKind,
        log: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
        fail_start: bool,
        shutdown: Option<CancellationToken>,
    }

    impl Stage for ProbeStage {
        fn kind(&self) -> StageKind {
            self.kind
        }

        fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
            self.log.lock().unwrap().push(format!("init {}", self.kind));
            if self.fail_init {
                return Err("init refused".into());
            }
            self.shutdown = Some(ctx.shutdown.clone());
            Ok(())
        }

        fn start(&mut self) -> Result<StageTask, GaError> {
            self.log.lock().unwrap().push(format!("start {}", self.kind));
            if self.fail_start {
                return Err("start refused".into());
            }
            let token = self.shutdown.clone().ok_or_else(|| not_initialized(self.kind))?;
            spawn_stage(self.kind, async move { token.cancelled().await })
        }
    }

    fn probe_registry(
        log: &Arc<Mutex<Vec<String>>>,
        fail_init: Option<StageKind>,
        fail_start: Option<StageKind>,
    ) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for kind in [
            StageKind::ControlReplay,
            StageKind::VideoSource,
            StageKind::ColorFilter,
            StageKind::VideoEncoder,
            StageKind::AudioSource,
            StageKind::AudioEncoder,
            StageKind::TransportServer,
        ] {
            let log = Arc::clone(log);
            registry.register(kind, move || {
                Box::new(ProbeStage {
                    kind,
                    log: Arc::clone(&log),
                    fail_init: fail_init == Some(kind),
                    fail_start: fail_start == Some(kind),
                    shutdown: None,
                })
            });
        }
        registry
    }

    #[test]
    fn plan_with_everything_enabled() {
        let pipeline = Pipeline::new(StageRegistry::new(), PipelineSettings::default());
        assert_eq!(
            pipeline.plan_with(true),
            vec![
                StageKind::ControlReplay,
                StageKind::VideoSource,
                StageKind::ColorFilter,
                StageKind::VideoEncoder,
                StageKind::AudioSource,
                StageKind::AudioEncoder,
                StageKind::TransportServer,
            ]
        );
    }

    #[test]
    fn plan_without_system_audio_keeps_encoder() {
        let pipeline = Pipeline::new(StageRegistry::new(), PipelineSettings::default());
        let plan = pipeline.plan_with(false);
        assert!(!plan.contains(&StageKind::AudioSource));
        assert!(plan.contains(&StageKind::AudioEncoder));
    }

    #[test]
    fn plan_without_audio_or_control() {
        let mut settings = PipelineSettings::default();
        settings.audio.enabled = false;
        settings.control_enabled = false;
        let pipeline = Pipeline::new(StageRegistry::new(), settings);
        assert_eq!(
            pipeline.plan_with(true),
            vec![
                StageKind::VideoSource,
                StageKind::ColorFilter,
                StageKind::VideoEncoder,
                StageKind::TransportServer,
            ]
        );
    }

    #[test]
    fn missing_factory_fails_load() {
        let registry = StageRegistry::new();
        let err = registry.load(StageKind::VideoEncoder).err().unwrap();
        assert!(matches!(
            err,
            GaError::Stage {
                stage: StageKind::VideoEncoder,
                phase: StagePhase::Load,
                ..
            }
        ));
    }

    #[test]
    fn mismatched_factory_fails_load() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = probe_registry(&log, None, None);
        let log2 = Arc::clone(&log);
        registry.register(StageKind::ColorFilter, move || {
            Box::new(ProbeStage {
                kind: StageKind::VideoSource,
                log: Arc::clone(&log2),
                fail_init: false,
                fail_start: false,
                shutdown: None,
            })
        });
        assert!(registry.load(StageKind::ColorFilter).is_err());
    }

    #[tokio::test]
    async fn launch_initialises_all_before_starting_any() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut settings = PipelineSettings::default();
        settings.audio.enabled = false;
        let pipeline = Pipeline::new(probe_registry(&log, None, None), settings);

        let running = pipeline.launch().unwrap();
        assert_eq!(running.stage_kinds().len(), 5);

        let log_snapshot = log.lock().unwrap().clone();
        let first_start = log_snapshot.iter().position(|l| l.starts_with("start")).unwrap();
        assert!(log_snapshot[..first_start].iter().all(|l| l.starts_with("init")));
        assert_eq!(log_snapshot[first_start..].len(), 5);
        assert_eq!(log_snapshot[0], "init control-replay");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn init_failure_aborts_launch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            probe_registry(&log, Some(StageKind::ColorFilter), None),
            PipelineSettings::default(),
        );
        let err = pipeline.launch().err().unwrap();
        assert!(matches!(
            err,
            GaError::Stage {
                stage: StageKind::ColorFilter,
                phase: StagePhase::Init,
                ..
            }
        ));
        // Nothing after the failing stage was touched, nothing started.
        let entries = log.lock().unwrap().clone();
        assert!(!entries.iter().any(|l| l.starts_with("start")));
        assert!(!entries.contains(&"init video-encoder".to_string()));
    }

    #[tokio::test]
    async fn start_failure_aborts_launch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            probe_registry(&log, None, Some(StageKind::TransportServer)),
            PipelineSettings::default(),
        );
        let err = pipeline.launch().err().unwrap();
        assert!(matches!(
            err,
            GaError::Stage {
                stage: StageKind::TransportServer,
                phase: StagePhase::Start,
                ..
            }
        ));
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let err = spawn_stage(StageKind::VideoSource, async {}).unwrap_err();
        assert!(matches!(err, GaError::Stage { phase: StagePhase::Start, .. }));
    }

    #[test]
    fn crop_rect_rules() {
        let rect = CropRect {
            left: 10,
            top: 20,
            right: 330,
            bottom: 260,
        };
        assert!(rect.validate().is_ok());
        assert_eq!((rect.width(), rect.height()), (320, 240));
        assert_eq!(rect.clip(0, 1000), (10, 259));
        assert_eq!(rect.clip(100, 100), (100, 100));

        let odd = CropRect { right: 331, ..rect };
        assert!(odd.validate().is_err());
        let empty = CropRect { right: 10, ..rect };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn capture_size_follows_crop() {
        let mut settings = PipelineSettings::default();
        assert_eq!(settings.capture_size(), (640, 360));
        settings.crop = Some(CropRect {
            left: 0,
            top: 0,
            right: 320,
            bottom: 200,
        });
        assert_eq!(settings.capture_size(), (320, 200));
    }
}
