//! Daemon wiring: capture → engine → IPC, lifecycle, and signals.

pub mod handler;

use crate::audio::capture::{CpalAudioSource, FrameCallback, StreamErrorCallback};
use crate::config::{AudioConfig, Config, ModelConfig};
use crate::defaults;
use crate::engine::{Engine, EngineConfig, EngineEvent};
use crate::error::{Result, VoxdError};
use crate::ipc::protocol::StatusPayload;
use crate::ipc::server::IpcServer;
use crate::stt::transcriber::Transcriber;
use crate::sys::suppress_audio_warnings;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Builds a transcriber from a model configuration. Injected so tests (and
/// builds without the `whisper` feature) can supply a mock.
pub type TranscriberFactory =
    Box<dyn Fn(&ModelConfig) -> Result<Arc<dyn Transcriber>> + Send + Sync>;

/// The default factory for this build.
#[cfg(feature = "whisper")]
pub fn default_transcriber_factory() -> TranscriberFactory {
    use crate::stt::whisper::{WhisperConfig, WhisperTranscriber};
    Box::new(|model| {
        let transcriber = WhisperTranscriber::new(WhisperConfig::from(model))?;
        Ok(Arc::new(transcriber) as Arc<dyn Transcriber>)
    })
}

/// Without the `whisper` feature the daemon still runs, with mocked
/// transcriptions, so the pipeline can be exercised end to end.
#[cfg(not(feature = "whisper"))]
pub fn default_transcriber_factory() -> TranscriberFactory {
    use crate::stt::transcriber::MockTranscriber;
    Box::new(|model| {
        eprintln!("voxd: built without the whisper feature; transcriptions are mocked");
        Ok(Arc::new(MockTranscriber::new(&model.path)) as Arc<dyn Transcriber>)
    })
}

/// Shared daemon state: the engine plus everything command handling needs.
pub struct DaemonState {
    pub engine: Arc<Engine>,
    pub config: tokio::sync::Mutex<Config>,
    pub config_path: Option<PathBuf>,
    pub transcriber_factory: TranscriberFactory,
    pub sampler: crate::engine::metrics::SystemSampler,
    pub started_at: Instant,
    audio: Mutex<Option<CpalAudioSource>>,
}

impl DaemonState {
    /// Open the device described by `audio_config` and feed the engine.
    pub fn start_audio(&self, audio_config: &AudioConfig) -> Result<()> {
        let source = CpalAudioSource::open(audio_config)?;

        let feed_engine = Arc::clone(&self.engine);
        let on_frame: FrameCallback =
            Box::new(move |samples, _sample_rate, timestamp| {
                feed_engine.feed_audio(samples, timestamp);
            });

        let error_engine = Arc::clone(&self.engine);
        let on_error: StreamErrorCallback = Arc::new(move |message| {
            eprintln!("voxd: {}", message);
            error_engine.report_device_error(message);
        });

        source.start(on_frame, on_error)?;
        *self.audio.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        Ok(())
    }

    /// Stop the capture stream, if any.
    pub fn stop_audio(&self) {
        if let Some(source) = self.audio.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = source.stop();
        }
    }

    /// Stop and reopen the device; used when audio parameters change.
    pub fn restart_audio(&self, audio_config: &AudioConfig) -> Result<()> {
        self.stop_audio();
        self.start_audio(audio_config)
    }

    /// Snapshot for a Status broadcast. Sync so the event bridge thread
    /// can call it.
    pub fn status_payload(&self, clients: usize) -> StatusPayload {
        let config = self.config.blocking_lock();
        StatusPayload {
            listening: self.engine.is_listening(),
            clients,
            model: config.stt.model.path.clone(),
            language: config.stt.model.language.clone(),
            vad_enabled: true,
            uptime: self.started_at.elapsed().as_secs(),
        }
    }
}

/// A fully wired daemon, not yet serving.
pub struct Daemon {
    state: Arc<DaemonState>,
    server: Arc<IpcServer>,
    event_rx: Mutex<Option<crossbeam_channel::Receiver<EngineEvent>>>,
}

impl Daemon {
    /// Wire up engine, state, and IPC server from a configuration.
    ///
    /// Loads the initial model through `factory`; a load failure here is a
    /// startup failure.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        factory: TranscriberFactory,
    ) -> Result<Self> {
        let transcriber = factory(&config.stt.model)?;

        let (event_tx, event_rx) = crossbeam_channel::bounded(256);
        let sample_rate = config.stt.audio.sample_rate;
        let engine = Arc::new(Engine::new(
            EngineConfig {
                vad: config.stt.vad.to_vad_config(sample_rate),
                queue_capacity: defaults::UTTERANCE_QUEUE_CAPACITY,
                sample_rate,
            },
            transcriber,
            event_tx,
        ));

        let server = Arc::new(IpcServer::new(PathBuf::from(&config.ipc.socket_path)));

        let state = Arc::new(DaemonState {
            engine,
            config: tokio::sync::Mutex::new(config),
            config_path,
            transcriber_factory: factory,
            sampler: crate::engine::metrics::SystemSampler::new(),
            started_at: Instant::now(),
            audio: Mutex::new(None),
        });

        Ok(Self {
            state,
            server,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub fn server(&self) -> &Arc<IpcServer> {
        &self.server
    }

    /// Start the engine worker, the IPC server, the pipeline→IPC bridge
    /// thread, and the periodic status tick.
    pub fn start_services(&self) -> Result<()> {
        self.state.engine.start();

        let event_rx = self
            .event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| VoxdError::Other("daemon services already started".to_string()))?;

        // Bridge: pipeline OS threads → tokio broadcast. Exits when the
        // engine's sender side is dropped.
        let bridge_state = Arc::clone(&self.state);
        let bridge_server = Arc::clone(&self.server);
        std::thread::Builder::new()
            .name("voxd-event-bridge".to_string())
            .spawn(move || {
                while let Ok(event) = event_rx.recv() {
                    match event {
                        EngineEvent::Transcription(result) => {
                            bridge_server.broadcast_transcription(&result);
                        }
                        EngineEvent::DeviceError { message } => {
                            eprintln!("voxd: audio device error: {}", message);
                            let payload =
                                bridge_state.status_payload(bridge_server.client_count());
                            bridge_server.broadcast_status(&payload);
                        }
                    }
                }
            })
            .map_err(|e| VoxdError::Other(format!("failed to spawn event bridge: {}", e)))?;

        // Serve the control socket.
        let run_server = Arc::clone(&self.server);
        let run_handler = Arc::new(handler::DaemonCommandHandler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.server),
        ));
        tokio::spawn(async move {
            if let Err(e) = run_server.run(run_handler).await {
                eprintln!("voxd: IPC server failed: {}", e);
            }
        });

        // Periodic status broadcast.
        let tick_state = Arc::clone(&self.state);
        let tick_server = Arc::clone(&self.server);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                defaults::STATUS_INTERVAL_SECS,
            ));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                let state = Arc::clone(&tick_state);
                let clients = tick_server.client_count();
                // blocking_lock is not allowed on a runtime thread.
                let payload =
                    tokio::task::spawn_blocking(move || state.status_payload(clients)).await;
                if let Ok(payload) = payload {
                    tick_server.broadcast_status(&payload);
                }
            }
        });

        Ok(())
    }

    /// Shut everything down in dependency order: audio first so the driver
    /// thread quiesces, then the engine (queue sentinel + join), then the
    /// IPC server (listener + connections + socket unlink).
    pub fn stop(&self) {
        self.state.stop_audio();
        self.state.engine.stop();
        self.server.stop();
    }
}

/// Run the daemon until SIGINT or SIGTERM.
pub async fn run_daemon(
    config: Config,
    config_path: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    suppress_audio_warnings();

    if !quiet {
        eprintln!("voxd: loading model '{}'...", config.stt.model.path);
    }
    let socket_path = config.ipc.socket_path.clone();
    let audio_config = config.stt.audio.clone();

    let daemon = Daemon::new(config, config_path, default_transcriber_factory())?;
    daemon.start_services()?;
    daemon.state().start_audio(&audio_config)?;

    if !quiet {
        let device = daemon
            .state()
            .audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.device_name().to_string())
            .unwrap_or_default();
        eprintln!("voxd: audio device: {}", device);
        eprintln!("voxd: listening on {}", socket_path);
        eprintln!("voxd: backend: {}", defaults::gpu_backend());
        eprintln!("voxd: ready (Ctrl+C to stop)");
    }

    wait_for_shutdown_signal().await;

    if !quiet {
        eprintln!("voxd: shutting down...");
    }
    daemon.stop();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                eprintln!("voxd: failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
