mod object_id;
pub mod quantity;

pub use self::object_id::{ObjectId, ObjectIdRef};

use chrono::{DateTime, Utc};
use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

pub static API_VERSION_POINTER: &str = "/apiVersion";
pub static KIND_POINTER: &str = "/kind";
pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A raw object as returned by the Kubernetes api server. We keep the json as is and only pull out the
/// fields that we need when mapping it to rows, so the same type works for every kind.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(msg) = K8sResource::validate(&value) {
            Err(InvalidResourceError {
                message: msg,
                value,
            })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn name(&self) -> &str {
        // validated on construction
        self.str_value(NAME_POINTER).unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value(NAMESPACE_POINTER)
    }

    pub fn uid(&self) -> &str {
        self.str_value("/metadata/uid").unwrap_or("")
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or("")
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_value(KIND_POINTER)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.str_value(API_VERSION_POINTER)
    }

    /// Returns the creation timestamp in unix milliseconds, or 0 if it is missing or malformed
    pub fn created(&self) -> i64 {
        self.timestamp_millis("/metadata/creationTimestamp")
            .unwrap_or(0)
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        let ns = self.namespace().unwrap_or("");
        ObjectIdRef::new(ns, self.name())
    }

    /// Iterates the `metadata.labels` of this resource. Non-string values are skipped.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|labels| labels.iter())
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    pub fn array(&self, pointer: &str) -> &[Value] {
        self.0
            .pointer(pointer)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        str_value(&self.0, pointer)
    }

    pub fn timestamp_millis(&self, pointer: &str) -> Option<i64> {
        timestamp_millis(&self.0, pointer)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        if !value.is_object() {
            return Err("resource must be a json object");
        }
        value
            .pointer(NAME_POINTER)
            .and_then(Value::as_str)
            .ok_or("missing metadata.name")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn str_value<'a, 'b>(json: &'a Value, pointer: &'b str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

/// Parses an RFC 3339 timestamp, as used throughout the Kubernetes api, into unix milliseconds
pub fn timestamp_millis(json: &Value, pointer: &str) -> Option<i64> {
    let raw = str_value(json, pointer)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(time) => Some(time.with_timezone(&Utc).timestamp_millis()),
        Err(err) => {
            log::debug!("Ignoring malformed timestamp '{}' at {}: {}", raw, pointer, err);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_without_name_is_rejected() {
        let err = K8sResource::from_value(json!({"metadata": {"namespace": "default"}}))
            .expect_err("expected an error");
        assert_eq!("missing metadata.name", err.message);
    }

    #[test]
    fn accessors_read_metadata() {
        let resource = K8sResource::from_value(json!({
            "metadata": {
                "namespace": "default",
                "name": "web-1",
                "uid": "abc",
                "creationTimestamp": "2024-01-02T03:04:05Z",
                "labels": {"app": "web", "weird": 7},
            }
        }))
        .unwrap();
        assert_eq!(ObjectIdRef::new("default", "web-1"), resource.get_object_id());
        assert_eq!("abc", resource.uid());
        assert_eq!(1704164645000, resource.created());
        let labels: Vec<_> = resource.labels().collect();
        assert_eq!(vec![("app", "web")], labels);
        assert!(resource.array("/spec/containers").is_empty());
    }
}
