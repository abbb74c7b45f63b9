use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::health::{GetSystemHealth, HealthMonitorActor, HealthStatus};

/// Serve `/metrics` and `/health` until the server stops. Needs a running
/// actix system.
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    health: ActorRef<HealthMonitorActor>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(health.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().body(e.to_string());
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(health: web::Data<ActorRef<HealthMonitorActor>>) -> impl Responder {
    match health.ask(GetSystemHealth).send().await {
        Ok(system) => {
            let body = system.to_json();
            match system.overall_status {
                HealthStatus::Unhealthy(_) => HttpResponse::ServiceUnavailable().json(body),
                _ => HttpResponse::Ok().json(body),
            }
        }
        Err(_) => {
            tracing::error!("Health monitor unavailable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unhealthy",
                "reason": "health monitor unavailable",
                "service": "canvas-notify"
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::UpdateHealth;
    use actix_web::{body::{to_bytes, MessageBody}, http::StatusCode};
    use kameo::Actor;
    use std::time::Duration;

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_registry() {
        let metrics = crate::metrics::Metrics::new().unwrap();
        metrics.record_push("delivered");

        let response = metrics_handler(web::Data::new(Arc::new(metrics.registry().clone())))
            .await
            .respond_to(&actix_web::test::TestRequest::default().to_http_request());

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body().boxed()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("pushes_total"));
    }

    #[actix_web::test]
    async fn test_health_endpoint_reflects_components() {
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new(Duration::from_secs(60)));
        let data = web::Data::new(monitor.clone());
        let request = actix_web::test::TestRequest::default().to_http_request();

        let healthy = health_handler(data.clone()).await.respond_to(&request);
        assert_eq!(healthy.status(), StatusCode::OK);

        assert!(monitor
            .tell(UpdateHealth::new("broker", HealthStatus::Unhealthy("Circuit breaker open".to_string())))
            .send()
            .await
            .is_ok());

        let unhealthy = health_handler(data).await.respond_to(&request);
        assert_eq!(unhealthy.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
