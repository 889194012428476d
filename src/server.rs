use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::reconcilers::{self, Context};
use crate::reconcilers::propagator::Propagator;
use crate::router;
use crate::state::AppState;
use crate::syncer::cluster::ClusterRegistry;
use crate::syncer::{SyncCtx, resources, vnode};

/// The assembled controller: hierarchy reconcilers, syncer, and the HTTP
/// state surface, bound to one super-cluster client. Tests construct it
/// with an injected client.
pub struct CanopyServer {
    pub state: AppState,
    pub addr: SocketAddr,
    pub listener: tokio::net::TcpListener,
    pub router: axum::Router,
    pub client: Client,
    pub config: Config,
}

impl CanopyServer {
    pub async fn new(bind_addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = Client::try_default().await?;
        Self::new_with_client(bind_addr, client, Config::load()?).await
    }

    pub async fn new_with_client(
        bind_addr: &str,
        client: Client,
        config: Config,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let state = AppState::new();
        let router = router::new_router(state.clone()).await;
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(CanopyServer {
            state,
            addr,
            listener,
            router,
            client,
            config,
        })
    }

    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ctx = self.controller_context();

        let registry = ClusterRegistry::new();
        let sync_ctx = SyncCtx {
            registry: registry.clone(),
            super_client: self.client.clone(),
            projection: self.config.projection.clone(),
            vnodes: self.state.vnodes.clone(),
            gauges: self.state.gauges.clone(),
        };
        resources::start_all(&sync_ctx, self.config.patrol_period());
        for spec in &self.config.clusters {
            if let Err(e) = registry.connect(spec).await {
                tracing::error!(cluster = %spec.name, error = %e, "could not connect tenant cluster");
            }
        }
        tokio::spawn(vnode::run_gc(
            self.state.vnodes.clone(),
            registry,
            self.config.vnode_grace(),
            std::time::Duration::from_secs(30),
        ));

        tokio::spawn(self.state.clone().run_publisher());
        let _controllers = tokio::spawn(reconcilers::run(ctx));

        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    pub fn controller_context(&self) -> Arc<Context> {
        let propagator = Propagator::new(self.client.clone(), self.state.forest.clone());
        Context::new(self.client.clone(), self.state.forest.clone(), propagator)
    }
}
