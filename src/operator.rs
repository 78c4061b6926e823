use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt};
use kube::{api::ListParams, runtime::events::Reporter, Api, Client};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    config::OperatorConfig,
    reconcilers::{
        credentials, domain, flavor, image, keypair, network, port, project, router, router_interface,
        security_group, server,
        store::{KubeObjectStore, OrcClient},
        subnet, volume, Context,
    },
    resources::Network,
    scope::ScopeCache,
    Metrics,
};

/// Every controller the operator can run, by name
pub const CONTROLLERS: [&str; 13] = [
    domain::CONTROLLER_NAME,
    flavor::CONTROLLER_NAME,
    image::CONTROLLER_NAME,
    keypair::CONTROLLER_NAME,
    network::CONTROLLER_NAME,
    port::CONTROLLER_NAME,
    project::CONTROLLER_NAME,
    router::CONTROLLER_NAME,
    router_interface::CONTROLLER_NAME,
    security_group::CONTROLLER_NAME,
    server::CONTROLLER_NAME,
    subnet::CONTROLLER_NAME,
    volume::CONTROLLER_NAME,
];

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "orc-operator".into(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a controller Context that can update State
    pub(crate) async fn to_context(&self, client: Client, config: &OperatorConfig) -> anyhow::Result<Context> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .context("registering metrics")?;
        let reporter = self.diagnostics.read().await.reporter.clone();
        Ok(Context {
            orc: OrcClient::new(Arc::new(KubeObjectStore::new(client, reporter))),
            scopes: Arc::new(ScopeCache::new(config.scope_cache_size, metrics.clone())),
            credentials: Default::default(),
            metrics,
            diagnostics: self.diagnostics.clone(),
            poll_period: config.default_poll_period,
        })
    }
}

/// Names in the enabled controller list which match no controller
pub fn unknown_controllers(config: &OperatorConfig) -> Vec<String> {
    config
        .enabled_controllers
        .iter()
        .flatten()
        .filter(|name| !CONTROLLERS.contains(&name.as_str()))
        .cloned()
        .collect()
}

pub struct Operator {
    state: State,
    config: OperatorConfig,
}

impl Operator {
    pub fn new(state: State, config: OperatorConfig) -> Self {
        Self { state, config }
    }

    /// Start every enabled controller (given the CRDs are installed) and run until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let client = Client::try_default()
            .await
            .context("failed to create kube Client")?;

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        if let Err(e) = Api::<Network>::all(client.clone())
            .list(&ListParams::default().limit(1))
            .await
        {
            error!("CRD is not queryable; {e:?}. Are the CRDs installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            return Err(e).context("querying Network objects");
        }

        for name in unknown_controllers(&self.config) {
            warn!(controller = %name, "ignoring unknown controller");
        }

        let ctx = self.state.to_context(client.clone(), &self.config).await?;
        let concurrency = self.config.max_concurrent_reconciles;
        let controllers: Vec<(&str, BoxFuture<'static, ()>)> = vec![
            (domain::CONTROLLER_NAME, domain::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (flavor::CONTROLLER_NAME, flavor::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (image::CONTROLLER_NAME, image::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (keypair::CONTROLLER_NAME, keypair::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (network::CONTROLLER_NAME, network::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (port::CONTROLLER_NAME, port::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (project::CONTROLLER_NAME, project::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (router::CONTROLLER_NAME, router::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (
                router_interface::CONTROLLER_NAME,
                router_interface::run(client.clone(), ctx.clone(), concurrency).boxed(),
            ),
            (
                security_group::CONTROLLER_NAME,
                security_group::run(client.clone(), ctx.clone(), concurrency).boxed(),
            ),
            (server::CONTROLLER_NAME, server::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (subnet::CONTROLLER_NAME, subnet::run(client.clone(), ctx.clone(), concurrency).boxed()),
            (volume::CONTROLLER_NAME, volume::run(client.clone(), ctx.clone(), concurrency).boxed()),
        ];

        let enabled: Vec<_> = controllers
            .into_iter()
            .filter(|(name, _)| self.config.controller_enabled(name))
            .map(|(_, run)| run)
            .collect();
        if enabled.is_empty() {
            anyhow::bail!("no controllers are enabled");
        }
        info!(controllers = enabled.len(), "starting controllers");
        // Controllers register with the credentials guard as they start
        futures::future::join(
            futures::future::join_all(enabled),
            credentials::run_guard(client, ctx, concurrency),
        )
        .await;

        Ok(())
    }
}
