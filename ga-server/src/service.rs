//! Streaming server lifecycle.
//!
//! Launches the pipeline, then the control server, then waits for the
//! shutdown token. Teardown runs in the opposite order.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ga_core::control::{ControlDispatcher, ControlServer};
use ga_core::error::GaError;
use ga_core::pipeline::{Pipeline, RunningPipeline, StageRegistry};

use crate::config::ServerConfig;

// ── GaServerService ──────────────────────────────────────────────

/// The top-level streaming service.
pub struct GaServerService {
    config: ServerConfig,
    registry: Option<StageRegistry>,
    shutdown: CancellationToken,
}

impl GaServerService {
    /// Create a service using the built-in stages.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, StageRegistry::builtin())
    }

    /// Create a service with a custom stage registry.
    pub fn with_registry(config: ServerConfig, registry: StageRegistry) -> Self {
        Self {
            config,
            registry: Some(registry),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run until stopped.
    ///
    /// 1. Launches every pipeline stage (any stage error is returned).
    /// 2. Builds the control dispatcher from the running pipeline.
    /// 3. Serves the control channel, if enabled.
    /// 4. On shutdown, stops the control server, then the pipeline.
    ///
    /// If the control channel cannot be set up, the pipeline is torn
    /// down before the error is returned.
    pub async fn run(mut self) -> Result<(), GaError> {
        let settings = self.config.to_pipeline_settings()?;
        match settings.crop {
            Some(rect) => info!("crop enabled: {rect}"),
            None => info!("crop disabled"),
        }

        let registry = self.registry.take().unwrap_or_else(StageRegistry::builtin);
        let pipeline = Pipeline::new(registry, settings).launch()?;

        let control_task = match self.start_control(&pipeline).await {
            Ok(task) => task,
            Err(e) => {
                error!("control channel setup failed: {e}");
                pipeline.shutdown().await;
                return Err(e);
            }
        };

        self.shutdown.cancelled().await;
        info!("shutting down");

        if let Some(task) = control_task {
            if let Err(e) = task.await {
                error!("control server ended abnormally: {e}");
            }
        }
        pipeline.shutdown().await;
        info!("ga-server stopped");
        Ok(())
    }

    // Everything borrowed from `pipeline` is taken before the returned
    // future's first await, so the future stays `Send` (`&RunningPipeline`
    // is not, since `Stage` is only `Send`).
    fn start_control(
        &self,
        pipeline: &RunningPipeline,
    ) -> impl std::future::Future<Output = Result<Option<JoinHandle<()>>, GaError>> + Send + '_
    {
        let prepared = if self.config.control.enabled {
            Some(
                ControlDispatcher::for_pipeline(pipeline, self.config.to_bbr_config())
                    .map(|dispatcher| (dispatcher, pipeline.input_sender())),
            )
        } else {
            None
        };

        async move {
            let Some(prepared) = prepared else {
                warn!("control channel disabled; bitrate will not adapt");
                return Ok(None);
            };

            let (dispatcher, input) = prepared?;
            let server = ControlServer::bind(self.config.control_addr()?).await?;
            info!("control channel on {}", server.local_addr()?);
            Ok(Some(tokio::spawn(server.run(
                dispatcher,
                input,
                self.shutdown.child_token(),
            ))))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ga_core::pipeline::{StageKind, StagePhase};
    use std::time::Duration;

    fn loopback() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.network.bind_address = "127.0.0.1".into();
        cfg.network.transport_port = 0;
        cfg.control.port = 0;
        cfg.video.width = 64;
        cfg.video.height = 48;
        cfg
    }

    #[tokio::test]
    async fn runs_until_stopped() {
        let svc = GaServerService::new(loopback());
        let stop = svc.shutdown_handle();
        let task = tokio::spawn(svc.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn busy_transport_port_is_fatal() {
        let busy = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut cfg = loopback();
        cfg.network.transport_port = busy.local_addr().unwrap().port();

        let err = GaServerService::new(cfg).run().await.unwrap_err();
        assert!(matches!(
            err,
            GaError::Stage {
                stage: StageKind::TransportServer,
                phase: StagePhase::Init,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn busy_control_port_stops_the_pipeline() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let media = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let media_port = media.local_addr().unwrap().port();
        drop(media);

        let mut cfg = loopback();
        cfg.control.port = held.local_addr().unwrap().port();
        cfg.network.transport_port = media_port;

        let result = tokio::time::timeout(Duration::from_secs(5), GaServerService::new(cfg).run())
            .await
            .unwrap();
        assert!(matches!(result, Err(GaError::Connection(_))));

        // The transport stage released its socket.
        assert!(std::net::UdpSocket::bind(("127.0.0.1", media_port)).is_ok());
    }

    #[tokio::test]
    async fn invalid_crop_is_fatal() {
        let mut cfg = loopback();
        cfg.video.crop = Some(crate::config::CropConfig {
            left: 0,
            top: 0,
            right: 33,
            bottom: 32,
        });
        let err = GaServerService::new(cfg).run().await.unwrap_err();
        assert!(matches!(err, GaError::Stage { phase: StagePhase::Init, .. }));
    }

    #[tokio::test]
    async fn runs_without_control_channel() {
        let mut cfg = loopback();
        cfg.control.enabled = false;
        cfg.audio.enabled = false;
        let svc = GaServerService::new(cfg);
        svc.stop();
        assert!(svc.run().await.is_ok());
    }
}
