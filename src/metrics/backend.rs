use crate::metrics::QueryError;

use async_trait::async_trait;

use std::collections::HashMap;
use std::sync::Arc;

/// One labeled value of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub timestamp_millis: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(labels: &[(&str, &str)], timestamp_millis: i64, value: f64) -> Sample {
        Sample {
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            timestamp_millis,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Vector(Vec<Sample>),
    Scalar { timestamp_millis: i64, value: f64 },
    /// Any other result type, such as a matrix or a string. Holds the name of the type.
    Other(String),
}

impl QueryResult {
    /// Returns the result as a list of samples. A scalar is a single sample without labels, and any
    /// other result type yields nothing.
    pub fn into_samples(self) -> Vec<Sample> {
        match self {
            QueryResult::Vector(samples) => samples,
            QueryResult::Scalar {
                timestamp_millis,
                value,
            } => vec![Sample {
                labels: HashMap::new(),
                timestamp_millis,
                value,
            }],
            QueryResult::Other(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub warnings: Vec<String>,
}

impl QueryResponse {
    pub fn vector(samples: Vec<Sample>) -> QueryResponse {
        QueryResponse {
            result: QueryResult::Vector(samples),
            warnings: Vec::new(),
        }
    }
}

/// A source of instant queries, such as Prometheus
#[async_trait]
pub trait MetricsBackend: Send + Sync + 'static {
    /// Evaluates the expression at the given unix millis, or at the backend's current time if `None`
    async fn query(&self, expression: &str, time: Option<i64>) -> Result<QueryResponse, QueryError>;
}

#[async_trait]
impl<B: MetricsBackend + ?Sized> MetricsBackend for Arc<B> {
    async fn query(&self, expression: &str, time: Option<i64>) -> Result<QueryResponse, QueryError> {
        (**self).query(expression, time).await
    }
}
