use std::time::Duration;

use clap::Parser;

use crate::messaging::consumer::ConsumerSettings;

/// Runtime configuration. Every flag can also be set through the environment
/// (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(name = "canvas-notify")]
#[command(about = "Real-time notification core: outbox, sessions, routing and push dispatch")]
pub struct Config {
    /// Database connection string (postgres://... or sqlite:...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, default_value_t = 10, env = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    #[arg(long, default_value = "127.0.0.1:9092", env = "KAFKA_BROKERS")]
    pub kafka_brokers: String,

    /// Topic prefix, topics are `{namespace}.{EventName}`
    #[arg(long, default_value = "canvas", env = "EVENT_NAMESPACE")]
    pub event_namespace: String,

    #[arg(long, default_value = "notification-service-notifications", env = "CONSUMER_GROUP")]
    pub consumer_group: String,

    /// Broker messages dispatched concurrently
    #[arg(long, default_value_t = 8, env = "DISPATCHER_WORKERS")]
    pub dispatcher_workers: usize,

    /// Address other nodes use to reach this one. No default: every node
    /// must advertise its own.
    #[arg(long, env = "HOSTNAME")]
    pub hostname: String,

    #[arg(long, default_value_t = 9400, env = "GRPC_PORT")]
    pub grpc_port: u16,

    #[arg(long, default_value_t = 5, env = "RPC_TIMEOUT_SECS")]
    pub rpc_timeout_secs: u64,

    /// Per-session outbound queue bound
    #[arg(long, default_value_t = 64, env = "OUTBOUND_QUEUE_CAPACITY")]
    pub outbound_queue_capacity: usize,

    #[arg(long, default_value_t = 9090, env = "METRICS_PORT")]
    pub metrics_port: u16,

    /// Run the built-in outbox relay instead of relying on a CDC connector
    #[arg(long, default_value_t = false, env = "RELAY_ENABLED")]
    pub relay_enabled: bool,

    #[arg(long, default_value_t = 500, env = "RELAY_POLL_INTERVAL_MS")]
    pub relay_poll_interval_ms: u64,

    #[arg(long, default_value_t = 100, env = "RELAY_BATCH_SIZE")]
    pub relay_batch_size: i64,
}

impl Config {
    /// `host:port` persisted as the owner of every connection this node accepts
    pub fn owner_node(&self) -> String {
        format!("{}:{}", self.hostname, self.grpc_port)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            brokers: self.kafka_brokers.clone(),
            group_id: self.consumer_group.clone(),
            namespace: self.event_namespace.clone(),
            workers: self.dispatcher_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_owner_node() {
        let config = Config::try_parse_from([
            "canvas-notify",
            "--database-url",
            "sqlite::memory:",
            "--hostname",
            "10.0.0.5",
            "--grpc-port",
            "9401",
        ])
        .unwrap();

        assert_eq!(config.owner_node(), "10.0.0.5:9401");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.event_namespace, "canvas");
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.relay_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.relay_batch_size, 100);
        assert!(!config.relay_enabled);

        let consumer = config.consumer_settings();
        assert_eq!(consumer.group_id, "notification-service-notifications");
        assert_eq!(consumer.workers, 8);
    }

    #[test]
    fn test_advertised_hostname_has_no_default() {
        use clap::CommandFactory;

        let command = Config::command();
        let hostname = command
            .get_arguments()
            .find(|arg| arg.get_id() == "hostname")
            .unwrap();
        assert!(hostname.is_required_set());
        assert!(hostname.get_default_values().is_empty());
    }
}
