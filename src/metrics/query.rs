//! The built in catalog of telemetry queries, one list per granularity.

/// One series to poll. Samples are stored under `category`, and `name_label`, if set, names the label
/// whose value tells apart multiple series of the same entity.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub category: String,
    pub expression: String,
    pub name_label: Option<String>,
}

impl QueryDescriptor {
    pub fn new(category: impl Into<String>, expression: impl Into<String>) -> QueryDescriptor {
        QueryDescriptor {
            category: category.into(),
            expression: expression.into(),
            name_label: None,
        }
    }

    pub fn named_by(mut self, label: impl Into<String>) -> QueryDescriptor {
        self.name_label = Some(label.into());
        self
    }

    /// The value that a sample with these labels is stored under, or the empty string
    pub fn series_name<'a>(&self, labels: &'a std::collections::HashMap<String, String>) -> &'a str {
        self.name_label
            .as_ref()
            .and_then(|label| labels.get(label))
            .map(String::as_str)
            .unwrap_or("")
    }
}

fn catalog(entries: &[(&str, &str, Option<&str>)]) -> Vec<QueryDescriptor> {
    entries
        .iter()
        .map(|(category, expression, label)| {
            let descriptor = QueryDescriptor::new(*category, *expression);
            match label {
                Some(label) => descriptor.named_by(*label),
                None => descriptor,
            }
        })
        .collect()
}

const CPU_CORES: &str = "on(node) group_left() (sum by (node) (machine_cpu_cores))";
const MEMORY_BYTES: &str = "on(node) group_left() (sum by (node) (machine_memory_bytes))";

/// Requests and limits per group, both absolute and relative to the capacity of the node
fn requests_and_limits(by: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for resource in ["cpu", "memory"].iter() {
        let capacity = if *resource == "cpu" { CPU_CORES } else { MEMORY_BYTES };
        for kind in ["request", "limit"].iter() {
            let metric = format!(
                "sum by ({}) (kube_pod_container_resource_{}s{{resource=\"{}\"}})",
                by, kind, resource
            );
            entries.push((format!("{}.{}", resource, kind), metric.clone()));
            entries.push((
                format!("{}.{}.percentage", resource, kind),
                format!("{} / {}", metric, capacity),
            ));
        }
    }
    entries
}

pub fn cluster_queries() -> Vec<QueryDescriptor> {
    catalog(&[
        ("node.count", "count(group by (node) (kube_node_info))", None),
        ("namespace.count", "count(kube_namespace_created)", None),
        ("pod.running", "sum(kube_pod_status_phase{phase=\"Running\"})", None),
        ("pod.pending", "sum(kube_pod_status_phase{phase=\"Pending\"})", None),
        ("pod.failed", "sum(kube_pod_status_phase{phase=\"Failed\"})", None),
        ("pod.succeeded", "sum(kube_pod_status_phase{phase=\"Succeeded\"})", None),
        (
            "cpu.usage",
            "avg(sum by (instance, cpu) (rate(node_cpu_seconds_total{mode!~\"idle|iowait|steal\"}[1m])))",
            None,
        ),
        (
            "memory.usage",
            "sum(node_memory_MemTotal_bytes - node_memory_MemAvailable_bytes) / sum(node_memory_MemTotal_bytes)",
            None,
        ),
        ("qos_by_class", "sum by (qos_class) (kube_pod_status_qos_class)", None),
        (
            "network.received.bytes",
            "sum by (device) (rate(node_network_receive_bytes_total{device!~\"(veth|azv|lxc).*\"}[2m]))",
            None,
        ),
        (
            "network.transmitted.bytes",
            "- sum by (device) (rate(node_network_transmit_bytes_total{device!~\"(veth|azv|lxc).*\"}[2m]))",
            None,
        ),
        (
            "network.received.bytes.bydevice",
            "sum by (device) (rate(node_network_receive_bytes_total{device!~\"(veth|azv|lxc).*\"}[2m]))",
            Some("device"),
        ),
    ])
}

pub fn node_queries() -> Vec<QueryDescriptor> {
    let mut queries = catalog(&[(
        "cpu.usage",
        "avg by (instance) (sum by (instance, cpu) (rate(node_cpu_seconds_total{mode!~\"idle|iowait|steal\"}[1m])))",
        None,
    )]);
    let (cpu, memory): (Vec<_>, Vec<_>) = requests_and_limits("node")
        .into_iter()
        .partition(|(category, _)| category.starts_with("cpu"));
    queries.extend(cpu.into_iter().map(|(c, e)| QueryDescriptor::new(c, e)));
    queries.extend(catalog(&[(
        "memory.usage",
        "sum by (instance) (node_memory_MemTotal_bytes - node_memory_MemAvailable_bytes) / sum by (instance) (node_memory_MemTotal_bytes)",
        None,
    )]));
    queries.extend(memory.into_iter().map(|(c, e)| QueryDescriptor::new(c, e)));
    queries.extend(catalog(&[
        (
            "network.received.bytes",
            "sum by (instance) (rate(node_network_receive_bytes_total[2m]))",
            None,
        ),
        (
            "network.transmitted.bytes",
            "- sum by (instance) (rate(node_network_transmit_bytes_total[2m]))",
            None,
        ),
        (
            "filesystem.usage",
            "sum by (instance, mountpoint) (1 - (node_filesystem_avail_bytes / node_filesystem_size_bytes))",
            Some("mountpoint"),
        ),
    ]));
    queries
}

pub fn pod_queries() -> Vec<QueryDescriptor> {
    let mut queries = catalog(&[
        (
            "cpu.usage",
            "sum by (node, namespace, pod) (rate(container_cpu_usage_seconds_total[1m]))",
            None,
        ),
        (
            "memory.usage",
            "sum by (node, namespace, pod) (container_memory_usage_bytes) / on (node) group_left(instance) label_replace(node_memory_MemTotal_bytes, \"node\", \"$1\", \"instance\", \"(.*)\")",
            None,
        ),
        (
            "cpu.usage.cores",
            "sum by (namespace, pod) (rate(container_cpu_usage_seconds_total[1m]))",
            None,
        ),
        (
            "memory.usage.bytes",
            "sum by (namespace, pod) (container_memory_usage_bytes)",
            None,
        ),
    ]);
    queries.extend(
        requests_and_limits("node, namespace, pod")
            .into_iter()
            .map(|(c, e)| QueryDescriptor::new(c, e)),
    );
    queries
}

pub fn container_queries() -> Vec<QueryDescriptor> {
    requests_and_limits("node, namespace, pod, container")
        .into_iter()
        .map(|(c, e)| QueryDescriptor::new(c, e))
        .collect()
}
