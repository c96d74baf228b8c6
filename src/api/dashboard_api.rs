// Entry point bundling the coordinator loop, the dashboard server and the resync listener.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::engine::coordinator::Coordinator;
use crate::engine::events::CoordinatorEvent;
use crate::engine::session::SessionStatus;
use crate::server::handler::DashboardServer;
use crate::source::http_rpc::HttpRpc;
use crate::source::traits::ProctorRpc;

/// A running proctor dashboard.
pub struct ProctorDashboard {
    coordinator: Arc<Coordinator>,
    server: DashboardServer,
    loop_task: JoinHandle<()>,
    resync_task: JoinHandle<()>,
}

impl ProctorDashboard {
    /// Connect to the exam server described by `config` and start watching `sessions`.
    pub async fn start(config: CoordinatorConfig, sessions: &[String]) -> Result<Self> {
        let rpc = HttpRpc::new(
            &config.base_url,
            config.auth_token.clone(),
            config.methods.clone(),
        )?;
        Self::start_with_rpc(config, Arc::new(rpc), sessions).await
    }

    pub async fn start_with_rpc(
        config: CoordinatorConfig,
        rpc: Arc<dyn ProctorRpc>,
        sessions: &[String],
    ) -> Result<Self> {
        let port = config.dashboard_port;
        let coordinator = Coordinator::new(config, rpc);
        for session_id in sessions {
            coordinator.watch(session_id, SessionStatus::Started);
        }

        let server = DashboardServer::start(coordinator.clone(), port).await?;
        let resync_task = spawn_resync_listener(coordinator.clone());
        let loop_task = tokio::spawn(coordinator.clone().run());

        info!(
            "proctor dashboard started: {} sessions at {}",
            sessions.len(),
            server.base_url()
        );
        Ok(Self {
            coordinator,
            server,
            loop_task,
            resync_task,
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Stop polling, cancel downloads and close the dashboard server.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        self.server.shutdown();
        self.resync_task.abort();
        if let Err(e) = self.loop_task.await {
            warn!("coordinator loop ended abnormally: {}", e);
        }
        info!("proctor dashboard stopped");
    }
}

/// Run `Coordinator::resync` whenever the critical-message reload fires.
fn spawn_resync_listener(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::Reload) => {
                    coordinator.resync().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("resync listener lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
