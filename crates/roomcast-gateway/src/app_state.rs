//! Shared application state for the roomcast gateway.
//!
//! Built once at startup from a validated config and a connected broker.
//! Construction spawns the hub, so it must run inside a Tokio runtime.

use std::sync::Arc;

use tokio::time::Duration;

use roomcast_core::error::Result;

use crate::broker::Broker;
use crate::config::GatewayConfig;
use crate::context::{Authenticator, TrustedHeaderAuthenticator};
use crate::hub::{Hub, HubSettings};
use crate::obs::GatewayMetrics;
use crate::policy::OriginAllowlist;
use crate::transport::session::{Republish, SessionCtx};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: GatewayConfig,
    hub: Hub,
    broker: Arc<dyn Broker>,
    origins: OriginAllowlist,
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<GatewayMetrics>,
    instance_id: Arc<str>,
}

impl AppState {
    /// State with the trusted-header authenticator from `auth.user_header`.
    pub fn new(cfg: GatewayConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let auth = TrustedHeaderAuthenticator::new(&cfg.auth.user_header)?;
        Self::with_authenticator(cfg, broker, Arc::new(auth))
    }

    pub fn with_authenticator(
        cfg: GatewayConfig,
        broker: Arc<dyn Broker>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let origins = OriginAllowlist::compile(&cfg.gateway.allowed_origins)?;
        let metrics = Arc::new(GatewayMetrics::default());
        let instance_id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());

        let settings = HubSettings::from_config(&cfg, Arc::clone(&instance_id));
        let hub = Hub::spawn(Arc::clone(&broker), settings, Arc::clone(&metrics));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                cfg,
                hub,
                broker,
                origins,
                authenticator,
                metrics,
                instance_id,
            }),
        })
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn origins(&self) -> &OriginAllowlist {
        &self.inner.origins
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.inner.authenticator.as_ref()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn is_draining(&self) -> bool {
        self.inner.metrics.is_draining()
    }

    /// Refuse new upgrades and report not-ready. One-way.
    pub fn set_draining(&self) {
        self.inner.metrics.set_draining();
    }

    pub(crate) fn session_ctx(&self) -> SessionCtx {
        let gw = &self.inner.cfg.gateway;
        let broker_cfg = &self.inner.cfg.broker;
        let republish = broker_cfg.republish_client_events.then(|| Republish {
            broker: Arc::clone(&self.inner.broker),
            topic_prefix: broker_cfg.topic_prefix.clone(),
            instance_id: Arc::clone(&self.inner.instance_id),
        });

        SessionCtx {
            hub: self.inner.hub.link(),
            republish,
            metrics: Arc::clone(&self.inner.metrics),
            ping_every: Duration::from_millis(gw.ping_interval_ms),
            read_deadline: Duration::from_millis(gw.idle_timeout_ms),
            write_timeout: Duration::from_millis(gw.write_timeout_ms),
        }
    }
}
