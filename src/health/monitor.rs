use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use sqlx::AnyPool;

use super::{ComponentHealth, HealthStatus};
use crate::metrics::Metrics;
use crate::utils::CircuitBreaker;

// ============================================================================
// Health Monitor Actor
// ============================================================================
//
// Aggregates component health for /health. Components report through
// UpdateHealth; the broker (via the producer's circuit breaker) and the
// database (via a trivial query) are probed periodically by the actor itself.
//
// ============================================================================

pub const COMPONENT_BROKER: &str = "broker";
pub const COMPONENT_DATABASE: &str = "database";

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

impl UpdateHealth {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            details: None,
        }
    }
}

#[derive(Debug)]
pub struct GetSystemHealth;

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: chrono::DateTime<Utc>,
}

impl SystemHealth {
    pub fn to_json(&self) -> serde_json::Value {
        let mut names: Vec<&String> = self.components.keys().collect();
        names.sort();

        let components: serde_json::Map<String, serde_json::Value> = names
            .into_iter()
            .map(|name| {
                let health = &self.components[name];
                (
                    name.clone(),
                    serde_json::json!({
                        "status": health.status.label(),
                        "reason": health.status.reason(),
                        "details": health.details,
                        "lastCheck": health.last_check.to_rfc3339(),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "status": self.overall_status.label(),
            "reason": self.overall_status.reason(),
            "service": "canvas-notify",
            "checkTime": self.check_time.to_rfc3339(),
            "components": components,
        })
    }
}

impl Reply for SystemHealth {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

// ============================================================================
// Health Monitor Actor
// ============================================================================

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    broker: Option<CircuitBreaker>,
    database: Option<AnyPool>,
    metrics: Option<Arc<Metrics>>,
    check_interval: Duration,
}

impl HealthMonitorActor {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            components: HashMap::new(),
            broker: None,
            database: None,
            metrics: None,
            check_interval,
        }
    }

    pub fn with_broker(mut self, breaker: CircuitBreaker) -> Self {
        self.broker = Some(breaker);
        self
    }

    pub fn with_database(mut self, pool: AnyPool) -> Self {
        self.database = Some(pool);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut has_degraded = false;
        let mut unhealthy_components = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => {
                    unhealthy_components.push(format!("{}: {}", name, msg));
                }
                HealthStatus::Degraded(_) => {
                    has_degraded = true;
                }
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy_components.is_empty() {
            unhealthy_components.sort();
            HealthStatus::Unhealthy(unhealthy_components.join(", "))
        } else if has_degraded {
            HealthStatus::Degraded("Some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

async fn probe_database(pool: &AnyPool) -> HealthStatus {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => HealthStatus::Healthy,
        Err(e) => HealthStatus::Unhealthy(format!("Database unreachable: {}", e)),
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("HealthMonitorActor started");

        let broker = state.broker.clone();
        let database = state.database.clone();
        let metrics = state.metrics.clone();
        let check_interval = state.check_interval;

        if broker.is_none() && database.is_none() {
            return Ok(state);
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;

                if let Some(ref breaker) = broker {
                    let circuit = breaker.state().await;
                    if let Some(ref metrics) = metrics {
                        metrics.circuit_breaker_state.set(circuit.code());
                    }

                    // Fire and forget - use tell
                    if actor_ref
                        .tell(UpdateHealth::new(COMPONENT_BROKER, circuit.into()))
                        .send()
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                if let Some(ref pool) = database {
                    let status = probe_database(pool).await;
                    if actor_ref
                        .tell(UpdateHealth::new(COMPONENT_DATABASE, status))
                        .send()
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            tracing::debug!("Health probes stopped");
        });

        Ok(state)
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let previous = self.components.get(&msg.component).map(|h| h.status.clone());
        if previous.as_ref() != Some(&msg.status) {
            tracing::info!(component = %msg.component, status = ?msg.status, "Component health changed");
        }

        let mut health = ComponentHealth::new(msg.component.clone(), msg.status);
        if let Some(details) = msg.details {
            health = health.with_details(details);
        }

        self.components.insert(msg.component, health);
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}
