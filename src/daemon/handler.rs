//! Command handler: routes IPC commands into the engine and config store.

use crate::daemon::DaemonState;
use crate::error::{Result, VoxdError};
use crate::ipc::server::{CommandHandler, IpcServer};
use serde_json::{Value, json};
use std::sync::Arc;

/// Handles client commands on behalf of the daemon.
pub struct DaemonCommandHandler {
    state: Arc<DaemonState>,
    server: Arc<IpcServer>,
}

impl DaemonCommandHandler {
    pub fn new(state: Arc<DaemonState>, server: Arc<IpcServer>) -> Self {
        Self { state, server }
    }

    async fn get_status(&self) -> Value {
        let config = self.state.config.lock().await;
        json!({
            "listening": self.state.engine.is_listening(),
            "model": config.stt.model.path,
            "language": config.stt.model.language,
            "vad_enabled": true,
            "clients": self.server.client_count(),
        })
    }

    async fn get_config(&self) -> Result<Value> {
        let config = self.state.config.lock().await;
        Ok(serde_json::to_value(&*config)?)
    }

    fn get_metrics(&self) -> Value {
        let pipeline = self.state.engine.metrics();
        let (cpu_usage, memory_usage_mb) = self.state.sampler.sample();
        json!({
            "avg_latency_ms": pipeline.avg_latency_ms,
            "avg_rtf": pipeline.avg_rtf,
            "cpu_usage": cpu_usage,
            "memory_usage_mb": memory_usage_mb,
            "transcriptions_count": pipeline.transcriptions_count,
        })
    }

    /// Merge-patch the live configuration and apply the delta to the
    /// running components. All-or-nothing: a failed apply restores the
    /// previous snapshot.
    async fn set_config(&self, params: &Value) -> Result<Value> {
        let patch = params.get("config").cloned().unwrap_or_else(|| json!({}));
        let save = params
            .get("save")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut config = self.state.config.lock().await;
        let before = config.clone();
        config.merge_patch(&patch)?;

        let mut reply = json!({ "success": true });

        if config.stt.vad != before.stt.vad {
            self.state
                .engine
                .update_vad(config.stt.vad.to_vad_config(config.stt.audio.sample_rate));
            reply["vad_updated"] = json!(true);
        }

        if config.stt.model.path != before.stt.model.path {
            match (self.state.transcriber_factory)(&config.stt.model) {
                Ok(transcriber) => {
                    self.state.engine.replace_transcriber(transcriber);
                    reply["model_updated"] = json!(true);
                }
                Err(e) => {
                    *config = before;
                    return Err(e);
                }
            }
        }

        if config.stt.model.language != before.stt.model.language {
            self.state.engine.set_language(&config.stt.model.language);
            reply["language_updated"] = json!(true);
        }

        if config.stt.audio != before.stt.audio {
            if let Err(e) = self.state.restart_audio(&config.stt.audio) {
                *config = before;
                return Err(e);
            }
        }

        if save {
            let path = self
                .state
                .config_path
                .clone()
                .or_else(crate::config::Config::default_path)
                .ok_or_else(|| VoxdError::Other("no config path to save to".to_string()))?;
            config.save(&path)?;
            reply["config_saved"] = json!(true);
        }

        Ok(reply)
    }

    async fn set_language(&self, params: &Value) -> Result<Value> {
        let language = params
            .get("language")
            .and_then(Value::as_str)
            .ok_or_else(|| VoxdError::Other("missing parameter: language".to_string()))?
            .to_string();

        let mut config = self.state.config.lock().await;
        self.state.engine.set_language(&language);
        config.stt.model.language = language.clone();
        Ok(json!({ "language": language }))
    }

    /// Reload the ASR back end with a new model path.
    ///
    /// The replacement is constructed first; on failure the prior model
    /// stays loaded and the command fails.
    async fn set_model(&self, params: &Value) -> Result<Value> {
        let model = params
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| VoxdError::Other("missing parameter: model".to_string()))?
            .to_string();

        let mut config = self.state.config.lock().await;
        let mut model_config = config.stt.model.clone();
        model_config.path = model.clone();

        let transcriber = (self.state.transcriber_factory)(&model_config)?;
        self.state.engine.replace_transcriber(transcriber);
        config.stt.model = model_config;
        Ok(json!({ "model": model }))
    }

    async fn set_vad_sensitivity(&self, params: &Value) -> Result<Value> {
        let sensitivity = params
            .get("sensitivity")
            .and_then(Value::as_f64)
            .ok_or_else(|| VoxdError::Other("missing parameter: sensitivity".to_string()))?;

        let mut config = self.state.config.lock().await;
        config.stt.vad.speech_start_threshold = sensitivity as f32;
        self.state
            .engine
            .update_vad(config.stt.vad.to_vad_config(config.stt.audio.sample_rate));
        Ok(json!({ "sensitivity": sensitivity }))
    }
}

#[async_trait::async_trait]
impl CommandHandler for DaemonCommandHandler {
    async fn handle(&self, action: &str, params: &Value) -> Result<Value> {
        match action {
            "pause" => {
                self.state.engine.pause();
                Ok(json!({ "status": "paused", "listening": false }))
            }
            "resume" => {
                self.state.engine.resume();
                Ok(json!({ "status": "listening", "listening": true }))
            }
            "get_status" => Ok(self.get_status().await),
            "get_config" => self.get_config().await,
            "set_config" => self.set_config(params).await,
            "set_language" => self.set_language(params).await,
            "set_model" => self.set_model(params).await,
            "set_vad_sensitivity" => self.set_vad_sensitivity(params).await,
            "get_metrics" => Ok(self.get_metrics()),
            other => Err(VoxdError::Other(format!("Unknown action: {}", other))),
        }
    }
}
