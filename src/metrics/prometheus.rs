use crate::config::PrometheusConfig;
use crate::error::Error;
use crate::metrics::{MetricsBackend, QueryError, QueryResponse, QueryResult, Sample};

use async_trait::async_trait;
use http::{header, Method, Request};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::ssl::{SslConnector, SslMethod};
use serde_json::Value;
use url::Url;

use std::collections::HashMap;
use std::time::Instant;

/// Runs instant queries against the Prometheus http api
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    base_url: Url,
}

impl PrometheusClient {
    pub fn new(config: &PrometheusConfig) -> Result<PrometheusClient, Error> {
        let base_url = Url::parse(config.url.as_str())?;
        if base_url.cannot_be_a_base() {
            return Err(QueryError::Transport(format!("invalid prometheus url: '{}'", config.url)).into());
        }

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let ssl = SslConnector::builder(SslMethod::tls())?;
        let https = HttpsConnector::with_connector(http, ssl)?;
        let http_client = HyperClient::builder().build(https);

        Ok(PrometheusClient {
            http_client,
            base_url,
        })
    }

    fn query_url(&self, expression: &str, time: Option<i64>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(&["api", "v1", "query"]);
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("query", expression);
            if let Some(millis) = time {
                let seconds = format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000));
                query.append_pair("time", &seconds);
            }
        }
        url
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query(&self, expression: &str, time: Option<i64>) -> Result<QueryResponse, QueryError> {
        let url = self.query_url(expression, time);
        let req = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let start_time = Instant::now();
        log::debug!("Starting prometheus query: {}", expression);
        let response = self
            .http_client
            .request(req)
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        log::debug!(
            "Finished prometheus query: {}, status: {}, duration: {}ms",
            expression,
            status,
            start_time.elapsed().as_millis()
        );
        decode_response(status, body.as_ref())
    }
}

#[derive(Deserialize, Debug)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ResponseData>,
    #[serde(rename = "errorType", default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize, Debug)]
struct VectorEntry {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// Decodes the body of a query response. Prometheus reports failed queries with a non-success status
/// and a json body saying why, so the body is looked at before the status.
pub(crate) fn decode_response(status: u16, body: &[u8]) -> Result<QueryResponse, QueryError> {
    let response: ApiResponse = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) if !(200..300).contains(&status) => return Err(QueryError::Http(status)),
        Err(e) => return Err(QueryError::Decode(e.to_string())),
    };
    if response.status != "success" {
        return Err(QueryError::Api {
            error_type: response.error_type.unwrap_or_default(),
            message: response.error.unwrap_or_default(),
        });
    }
    if !(200..300).contains(&status) {
        return Err(QueryError::Http(status));
    }

    let data = response
        .data
        .ok_or_else(|| QueryError::Decode("response has no data".to_owned()))?;
    let result = match data.result_type.as_str() {
        "vector" => {
            let entries: Vec<VectorEntry> = serde_json::from_value(data.result)
                .map_err(|e| QueryError::Decode(e.to_string()))?;
            let samples = entries
                .into_iter()
                .map(|entry| {
                    Ok(Sample {
                        labels: entry.metric,
                        timestamp_millis: seconds_to_millis(entry.value.0),
                        value: parse_value(&entry.value.1)?,
                    })
                })
                .collect::<Result<Vec<_>, QueryError>>()?;
            QueryResult::Vector(samples)
        }
        "scalar" => {
            let (timestamp, value): (f64, String) = serde_json::from_value(data.result)
                .map_err(|e| QueryError::Decode(e.to_string()))?;
            QueryResult::Scalar {
                timestamp_millis: seconds_to_millis(timestamp),
                value: parse_value(&value)?,
            }
        }
        other => QueryResult::Other(other.to_owned()),
    };
    Ok(QueryResponse {
        result,
        warnings: response.warnings,
    })
}

fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

/// Sample values are strings so that they can hold NaN and the infinities
fn parse_value(value: &str) -> Result<f64, QueryError> {
    match value {
        "NaN" => Ok(std::f64::NAN),
        "+Inf" | "Inf" => Ok(std::f64::INFINITY),
        "-Inf" => Ok(std::f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| QueryError::Decode(format!("invalid sample value: '{}'", other))),
    }
}
