//! Services a node can run, by logical name.
//!
//! `main` starts the names listed in `services` in order and shuts them
//! down in reverse.

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use std::sync::Arc;
use tracing::info;

use tether_common::constants::services;

use crate::agent::{Agent, AgentSettings};
use crate::config::{AppConfig, Placement};
use crate::coordinator::{Coordinator, CoordinatorSettings, rules};
use crate::flock::FlockKey;
use crate::signing::KeyPair;

/// What every service constructor receives
pub struct ServiceContext {
    pub config: AppConfig,
    pub placement: Placement,
    pub flock: FlockKey,
}

/// A started service
#[async_trait]
pub trait RunningService: Send {
    fn name(&self) -> &'static str;
    async fn shutdown(self: Box<Self>);
}

type Constructor = fn(&ServiceContext) -> LocalBoxFuture<'_, Result<Box<dyn RunningService>>>;

const REGISTRY: &[(&str, Constructor)] = &[
    ("coordinator", coordinator_service),
    ("agent", agent_service),
];

fn coordinator_service(ctx: &ServiceContext) -> LocalBoxFuture<'_, Result<Box<dyn RunningService>>> {
    start_coordinator(ctx).boxed_local()
}

fn agent_service(ctx: &ServiceContext) -> LocalBoxFuture<'_, Result<Box<dyn RunningService>>> {
    start_agent(ctx).boxed_local()
}

/// Look up a service constructor
pub fn constructor(name: &str) -> Option<Constructor> {
    REGISTRY.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

/// Reject unknown names before anything starts
pub fn validate(names: &[String]) -> Result<()> {
    for name in names {
        if constructor(name).is_none() {
            let known: Vec<&str> = REGISTRY.iter().map(|(n, _)| *n).collect();
            bail!(tether_common::TetherError::Config(format!(
                "unknown service {:?} (known: {})",
                name,
                known.join(", ")
            )));
        }
    }
    Ok(())
}

/// Start `names` in order; on failure, already started services are stopped
pub async fn start_all(ctx: &ServiceContext, names: &[String]) -> Result<Vec<Box<dyn RunningService>>> {
    validate(names)?;
    let mut running: Vec<Box<dyn RunningService>> = Vec::with_capacity(names.len());
    for name in names {
        let Some(start) = constructor(name) else {
            continue;
        };
        match start(ctx).await {
            Ok(service) => {
                info!(service = name.as_str(), "✅ Service started");
                running.push(service);
            }
            Err(e) => {
                stop_all(running).await;
                return Err(e.context(format!("starting {}", name)));
            }
        }
    }
    Ok(running)
}

/// Shut services down in reverse start order
pub async fn stop_all(running: Vec<Box<dyn RunningService>>) {
    for service in running.into_iter().rev() {
        let name = service.name();
        service.shutdown().await;
        info!(service = name, "Service stopped");
    }
}

#[async_trait]
impl RunningService for Coordinator {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    async fn shutdown(self: Box<Self>) {
        Coordinator::shutdown(*self).await
    }
}

#[async_trait]
impl RunningService for Agent {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn shutdown(self: Box<Self>) {
        Agent::shutdown(*self).await
    }
}

async fn start_coordinator(ctx: &ServiceContext) -> Result<Box<dyn RunningService>> {
    let config = &ctx.config;
    let c = &config.coordinator;
    let key_path = config.data_dir.join("steward.key");
    let keys = Arc::new(KeyPair::load_or_generate(
        Some(&key_path),
        services::STEWARD_REV,
        &ctx.placement.principal,
    )?);
    let settings = CoordinatorSettings {
        placement: ctx.placement.clone(),
        steward_addr: c.steward_addr.clone(),
        registry_addr: c.registry_addr.clone(),
        db_path: Some(config.data_dir.join("registry.db")),
        tick: c.tick(),
        reeve_timeout: c.reeve_timeout(),
        callback_retry: c.callback_retry(),
        allowed_algorithms: c.allowed_algorithms.clone(),
        rules: rules::load_rules(c.rules_file.as_deref()).await?,
    };
    let coordinator = Coordinator::start(settings, keys, ctx.flock.clone()).await?;
    Ok(Box::new(coordinator))
}

async fn start_agent(ctx: &ServiceContext) -> Result<Box<dyn RunningService>> {
    let config = &ctx.config;
    let a = &config.agent;
    let key_path = config.data_dir.join("reeve.key");
    let keys = Arc::new(KeyPair::load_or_generate(
        Some(&key_path),
        services::REEVE_REV,
        &ctx.placement.principal,
    )?);
    let settings = AgentSettings {
        placement: ctx.placement.clone(),
        listen_addr: a.listen_addr.clone(),
        registry_url: format!("http://{}", a.registry_addr),
        data_dir: config.data_dir.join("reeve"),
        ping_delay: a.ping_delay(),
        ping_timeout: a.ping_timeout(),
        register_timeout: a.register_timeout(),
        forwarder_queue: a.forwarder_queue,
        allowed_algorithms: a.allowed_algorithms.clone(),
    };
    let agent = Agent::start(settings, keys, ctx.flock.clone()).await?;
    Ok(Box::new(agent))
}
