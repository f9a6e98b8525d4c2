//! Configuration for the two engines and the clients they talk to. Nothing in here reads flags or
//! files other than the in-cluster service account credentials; callers build these structs directly.
use crate::metrics::query::{self, QueryDescriptor};
use crate::schema::Granularity;
use crate::store::StreamerConfig;

use std::io;
use std::time::Duration;

pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(55);
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_MAX_FILL: Duration = Duration::from_millis(250);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Everything needed to talk to the Kubernetes api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    /// The full value of the Authorization header, e.g. `Bearer <token>`
    pub service_account_token: String,
    pub ca_file_path: Option<String>,
    pub user_agent: String,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    pub fn new(
        api_server_endpoint: impl Into<String>,
        token: &str,
        user_agent: impl Into<String>,
    ) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: api_server_endpoint.into(),
            service_account_token: format!("Bearer {}", token.trim()),
            ca_file_path: None,
            user_agent: user_agent.into(),
            verify_ssl_certs: true,
        }
    }

    /// Builds a config from the service account that is mounted into every pod. The api server is
    /// addressed through `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` when both are set.
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;

        let api_server_endpoint = match (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
            _ => format!("https://{}", API_SERVER_HOSTNAME),
        };

        let mut config = ClientConfig::new(api_server_endpoint, &token, user_agent);
        if std::path::Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            config.ca_file_path = Some(SERVICE_ACCOUNT_CA_PATH.to_owned());
        }
        Ok(config)
    }

    pub fn with_ca_file(mut self, path: impl Into<String>) -> Self {
        self.ca_file_path = Some(path.into());
        self
    }

    pub fn with_ssl_verification(mut self, verify: bool) -> Self {
        self.verify_ssl_certs = verify;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    /// Base url of the Prometheus server, without the `/api/v1` suffix
    pub url: String,
}

impl PrometheusConfig {
    pub fn new(url: impl Into<String>) -> PrometheusConfig {
        PrometheusConfig { url: url.into() }
    }
}

impl Default for PrometheusConfig {
    fn default() -> PrometheusConfig {
        PrometheusConfig::new("http://prometheus-server")
    }
}

/// Settings of the metrics ingestion pipeline. The default carries the full built-in query catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub batch_max_fill: Duration,
    pub channel_capacity: usize,
    pub cluster_queries: Vec<QueryDescriptor>,
    pub node_queries: Vec<QueryDescriptor>,
    pub pod_queries: Vec<QueryDescriptor>,
    pub container_queries: Vec<QueryDescriptor>,
}

impl PipelineConfig {
    /// A config without any queries
    pub fn empty() -> PipelineConfig {
        PipelineConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_max_fill: DEFAULT_BATCH_MAX_FILL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            cluster_queries: Vec::new(),
            node_queries: Vec::new(),
            pod_queries: Vec::new(),
            container_queries: Vec::new(),
        }
    }

    pub fn queries(&self, granularity: Granularity) -> &[QueryDescriptor] {
        match granularity {
            Granularity::Cluster => &self.cluster_queries,
            Granularity::Node => &self.node_queries,
            Granularity::Pod => &self.pod_queries,
            Granularity::Container => &self.container_queries,
        }
    }

    pub fn with_queries(mut self, granularity: Granularity, queries: Vec<QueryDescriptor>) -> Self {
        match granularity {
            Granularity::Cluster => self.cluster_queries = queries,
            Granularity::Node => self.node_queries = queries,
            Granularity::Pod => self.pod_queries = queries,
            Granularity::Container => self.container_queries = queries,
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_max_fill(mut self, max_fill: Duration) -> Self {
        self.batch_max_fill = max_fill;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig::new(self.batch_size, self.batch_max_fill)
    }
}

impl Default for PipelineConfig {
    fn default() -> PipelineConfig {
        PipelineConfig::empty()
            .with_queries(Granularity::Cluster, query::cluster_queries())
            .with_queries(Granularity::Node, query::node_queries())
            .with_queries(Granularity::Pod, query::pod_queries())
            .with_queries(Granularity::Container, query::container_queries())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Only watch objects in this namespace. All namespaces are watched if `None`.
    pub namespace: Option<String>,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Fetch container logs while reconciling kinds that have containers
    pub fetch_logs: bool,
    /// Fetch usage snapshots from the metrics api while reconciling kinds that have containers
    pub fetch_usage: bool,
}

impl ReconcilerConfig {
    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self
    }

    pub fn with_logs(mut self, fetch_logs: bool) -> Self {
        self.fetch_logs = fetch_logs;
        self
    }

    pub fn with_usage(mut self, fetch_usage: bool) -> Self {
        self.fetch_usage = fetch_usage;
        self
    }
}

impl Default for ReconcilerConfig {
    fn default() -> ReconcilerConfig {
        ReconcilerConfig {
            namespace: None,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(300),
            fetch_logs: true,
            fetch_usage: true,
        }
    }
}
