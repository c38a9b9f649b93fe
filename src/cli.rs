use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::{ClusterControlConfig, CollectorSpec, KubectlConfig};
use crate::config::BuilderSettings;
use crate::events::ConsumerConfig;
use crate::monitor::MonitorConfig;

#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(about = "Deploy and monitor per-tenant telemetry collectors from sink events")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: resolve settings, print them and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a .env file loaded before settings are resolved
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Redis URL for the event streams
    #[arg(long, env = "MAESTRO_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Redis connection pool size
    #[arg(long, env = "MAESTRO_REDIS_POOL_SIZE", default_value = "16")]
    pub redis_pool_size: usize,

    /// Postgres URL for deployments; kept in memory when unset
    #[arg(long, env = "MAESTRO_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum Postgres connections
    #[arg(long, env = "MAESTRO_DATABASE_MAX_CONNECTIONS", default_value = "10")]
    pub database_max_connections: u32,

    /// Passphrase protecting stored sink credentials
    #[arg(long, env = "MAESTRO_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Namespace collectors are deployed into
    #[arg(long, env = "MAESTRO_NAMESPACE", default_value = "otelcollectors")]
    pub namespace: String,

    /// Collector container image
    #[arg(
        long,
        env = "MAESTRO_COLLECTOR_IMAGE",
        default_value = "otel/opentelemetry-collector-contrib:0.98.0"
    )]
    pub collector_image: String,

    /// kubectl binary
    #[arg(long, env = "MAESTRO_KUBECTL", default_value = "kubectl")]
    pub kubectl: String,

    /// kubeconfig context; the current context when unset
    #[arg(long, env = "MAESTRO_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    /// Kafka brokers the collectors consume from (comma-separated)
    #[arg(
        long,
        env = "MAESTRO_KAFKA_BROKERS",
        value_delimiter = ',',
        default_value = "kafka:9092"
    )]
    pub kafka_brokers: Vec<String>,

    /// Base URL of the tenant sink registry
    #[arg(long, env = "MAESTRO_SINKS_URL", default_value = "http://127.0.0.1:9000")]
    pub sinks_url: String,

    /// Bearer token for the sink registry
    #[arg(long, env = "MAESTRO_SINKS_TOKEN", hide_env_values = true)]
    pub sinks_token: Option<String>,

    /// Inbound sink lifecycle stream
    #[arg(long, default_value = "sinks.lifecycle")]
    pub lifecycle_stream: String,

    /// Inbound sink activity stream
    #[arg(long, default_value = "sinks.activity")]
    pub activity_stream: String,

    /// Inbound sink idle stream
    #[arg(long, default_value = "sinks.idle")]
    pub idle_stream: String,

    /// Outbound deployment status stream
    #[arg(long, default_value = "sinks.status")]
    pub status_stream: String,

    /// Consumer group shared by every replica
    #[arg(long, env = "MAESTRO_CONSUMER_GROUP", default_value = "maestro")]
    pub consumer_group: String,

    /// Consumer name within the group; defaults to the host name
    #[arg(long, env = "MAESTRO_CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    /// Seconds a pending lifecycle entry may idle before redelivery
    #[arg(long, default_value = "60")]
    pub lifecycle_redelivery_secs: u64,

    /// Seconds a pending activity or idle entry may idle before redelivery
    #[arg(long, default_value = "30")]
    pub activity_redelivery_secs: u64,

    /// Monitor interval in seconds
    #[arg(long, default_value = "60")]
    pub monitor_interval: u64,

    /// Collector log lines inspected per tick
    #[arg(long, default_value = "50")]
    pub log_tail: u32,

    /// Collector log lookback in seconds
    #[arg(long, default_value = "300")]
    pub log_since: u64,

    /// Attempts while waiting for a collector to become active
    #[arg(long, default_value = "5")]
    pub poll_attempts: u32,

    /// Seconds between those attempts
    #[arg(long, default_value = "1")]
    pub poll_interval: u64,

    /// Bind address for /health and /metrics
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,
}

/// Typed settings for every component
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub redis_pool_size: usize,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub sinks_url: String,
    pub sinks_token: Option<String>,
    pub status_stream: String,
    pub bind_addr: String,
    pub builder: BuilderSettings,
    pub collector: CollectorSpec,
    pub kubectl: KubectlConfig,
    pub cluster: ClusterControlConfig,
    pub lifecycle: ConsumerConfig,
    pub activity: ConsumerConfig,
    pub idle: ConsumerConfig,
    pub monitor: MonitorConfig,
}

impl Args {
    /// Resolve typed settings; `host` names this consumer when none is given
    pub fn into_settings(self, host: &str) -> Settings {
        let consumer = self.consumer_name.clone().unwrap_or_else(|| host.to_string());
        let lifecycle_idle = Duration::from_secs(self.lifecycle_redelivery_secs);
        let activity_idle = Duration::from_secs(self.activity_redelivery_secs);
        let stream = |name: &str, redelivery_idle: Duration| ConsumerConfig {
            redelivery_idle,
            ..ConsumerConfig::for_stream(name, &self.consumer_group, &consumer)
        };

        Settings {
            lifecycle: stream(&self.lifecycle_stream, lifecycle_idle),
            activity: stream(&self.activity_stream, activity_idle),
            idle: stream(&self.idle_stream, activity_idle),
            builder: BuilderSettings {
                kafka_brokers: self
                    .kafka_brokers
                    .iter()
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty())
                    .collect(),
                ..Default::default()
            },
            collector: CollectorSpec {
                namespace: self.namespace.clone(),
                image: self.collector_image.clone(),
            },
            kubectl: KubectlConfig {
                binary: self.kubectl.clone(),
                context: self.kube_context.clone(),
                namespace: self.namespace.clone(),
            },
            cluster: ClusterControlConfig {
                poll_attempts: self.poll_attempts,
                poll_interval: Duration::from_secs(self.poll_interval),
                ..Default::default()
            },
            monitor: MonitorConfig {
                interval: Duration::from_secs(self.monitor_interval),
                log_tail: self.log_tail,
                log_since: Duration::from_secs(self.log_since),
            },
            redis_url: self.redis_url,
            redis_pool_size: self.redis_pool_size,
            database_url: self.database_url,
            database_max_connections: self.database_max_connections,
            sinks_url: self.sinks_url,
            sinks_token: self.sinks_token,
            status_stream: self.status_stream,
            bind_addr: self.bind_addr,
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Hide the password part of a connection URL
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}

/// Format the resolved settings for dry-run output; secrets are never shown
pub fn format_settings(settings: &Settings) -> String {
    let mut output = String::new();

    output.push_str(&format!("maestro v{} - Dry Run Mode\n\n", env!("CARGO_PKG_VERSION")));

    output.push_str("Storage:\n");
    output.push_str(&format!("  Redis:    {}\n", redact_url(&settings.redis_url)));
    match settings.database_url {
        Some(ref url) => output.push_str(&format!("  Postgres: {}\n", redact_url(url))),
        None => output.push_str("  Postgres: (none, deployments kept in memory)\n"),
    }

    output.push_str("\nStreams:\n");
    for consumer in [&settings.lifecycle, &settings.activity, &settings.idle] {
        output.push_str(&format!(
            "  <- {} (group {}, consumer {}, redelivery after {}s)\n",
            consumer.stream,
            consumer.group,
            consumer.consumer,
            consumer.redelivery_idle.as_secs()
        ));
    }
    output.push_str(&format!("  -> {}\n", settings.status_stream));

    output.push_str("\nCollectors:\n");
    output.push_str(&format!("  Namespace: {}\n", settings.collector.namespace));
    output.push_str(&format!("  Image:     {}\n", settings.collector.image));
    output.push_str(&format!("  Brokers:   {}\n", settings.builder.kafka_brokers.join(", ")));
    output.push_str(&format!(
        "  kubectl:   {}{}\n",
        settings.kubectl.binary,
        settings
            .kubectl
            .context
            .as_deref()
            .map(|c| format!(" (context {})", c))
            .unwrap_or_default()
    ));

    output.push_str("\nMonitor:\n");
    output.push_str(&format!("  Interval: {}s\n", settings.monitor.interval.as_secs()));
    output.push_str(&format!(
        "  Logs:     last {} lines within {}s\n",
        settings.monitor.log_tail,
        settings.monitor.log_since.as_secs()
    ));
    output.push_str(&format!("  Registry: {}\n", settings.sinks_url));

    output.push_str(&format!("\nHTTP: {}\n", settings.bind_addr));
    output
}
