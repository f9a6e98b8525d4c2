mod request;

use crate::config::ClientConfig;
use crate::k8s_types::{self, K8sType};
use crate::resource::{K8sResource, ObjectIdRef};

use async_trait::async_trait;
use bytes::Buf;
use futures_util::stream::{self, BoxStream, StreamExt};
use http::{Request, Response};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use lazy_static::lazy_static;
use openssl::ssl::{SslConnector, SslMethod};
use regex::bytes::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::io;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref NEWLINE_REGEX: Regex = Regex::new("([\\r\\n]+)").unwrap();
}

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(http::StatusCode),
    Request(http::Error),
    InvalidEndpoint(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Serde(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Request(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Http(_) | Error::InvalidEndpoint(_) => None,
        }
    }
}

impl Error {
    pub fn http(status: http::StatusCode) -> Error {
        Error::Http(status)
    }

    fn endpoint(config: &ClientConfig) -> Error {
        Error::InvalidEndpoint(config.api_server_endpoint.clone())
    }

    pub fn is_http_410(&self) -> bool {
        self.is_http_status(410)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status) => status.as_u16() == code,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(ref e) => write!(f, "Http Error: {}", e),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::InvalidEndpoint(ref endpoint) => {
                write!(f, "Invalid api server endpoint: '{}'", endpoint)
            }
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, Error>>;

/// The parts of the Kubernetes api that mirroring depends on. `Client` is the real implementation,
/// and the testkit provides a scripted one.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error>;

    /// Starts a watch that ends when the api server closes the connection
    async fn watch(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, Error>;

    /// Returns the current logs of the container, or `None` if there are none yet
    async fn container_logs(
        &self,
        pod: ObjectIdRef<'_>,
        container: &str,
    ) -> Result<Option<String>, Error>;

    /// Returns the `PodMetrics` object for the pod, or `None` if the metrics server has none yet
    async fn pod_metrics(&self, pod: ObjectIdRef<'_>) -> Result<Option<K8sResource>, Error>;
}

#[async_trait]
impl<A: ClusterApi + ?Sized> ClusterApi for Arc<A> {
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        (**self).list(k8s_type, namespace).await
    }

    async fn watch(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, Error> {
        (**self).watch(k8s_type, namespace, resource_version).await
    }

    async fn container_logs(
        &self,
        pod: ObjectIdRef<'_>,
        container: &str,
    ) -> Result<Option<String>, Error> {
        (**self).container_logs(pod, container).await
    }

    async fn pod_metrics(&self, pod: ObjectIdRef<'_>) -> Result<Option<K8sResource>, Error> {
        (**self).pod_metrics(pod).await
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
}

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        if let Some(path) = config.ca_file_path.as_ref() {
            ssl.set_ca_file(path.as_str())?;
        }

        if config.verify_ssl_certs {
            ssl.set_verify(openssl::ssl::SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verifification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(openssl::ssl::SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;

        let client = HyperClient::builder().build(https);

        let inner = ClientInner {
            http_client: client,
            config,
        };
        Ok(Client(Arc::new(inner)))
    }

    pub async fn list_all(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, namespace)?;
        self.get_response_body(req).await
    }

    pub async fn watch_lines(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent>, Error> {
        let req =
            request::watch_request(&self.0.config, k8s_type, resource_version, None, namespace)?;
        self.get_response_lines_deserialized(req).await
    }

    /// gets the requested resource by name and converts a 404 response into a None value
    pub async fn get_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        match self.get_response_body::<Value>(req).await {
            Ok(body) => Ok(Some(body)),
            Err(ref e) if e.is_http_status(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads the logs of one container. The api server responds with 400 for containers that haven't
    /// started yet, and 404 once the pod is gone, both of which are returned as `None`.
    pub async fn get_logs(
        &self,
        pod: &ObjectIdRef<'_>,
        container: &str,
    ) -> Result<Option<String>, Error> {
        let req =
            request::logs_request(&self.0.config, k8s_types::core::v1::Pod, pod, container)?;
        let response = self.get_response(req).await?;
        match response.status().as_u16() {
            200..=299 => {
                let body = hyper::body::to_bytes(response.into_body()).await?;
                Ok(Some(String::from_utf8_lossy(body.as_ref()).into_owned()))
            }
            400 | 404 => {
                log::debug!(
                    "No logs available for container '{}' of pod: {}, status: {}",
                    container,
                    pod,
                    response.status()
                );
                Ok(None)
            }
            _ => Err(Error::http(response.status())),
        }
    }

    async fn get_response_lines_deserialized<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<LineDeserializer<T>, Error> {
        let lines = self.get_response_lines(req).await?;
        Ok(LineDeserializer::<T>::new(lines))
    }

    async fn get_response_lines(&self, req: Request<Body>) -> Result<Lines, Error> {
        let resp = self.get_response(req).await?;
        if !resp.status().is_success() {
            Err(Error::http(resp.status()))
        } else {
            Ok(Lines::from_body(resp.into_body()))
        }
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        self.private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await
    }

    async fn get_response_body<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        let response = self
            .private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await?;

        let status_code = response.status().as_u16();
        let result = Client::read_body(response).await;
        let success = result.is_ok();
        let duration = start_time.elapsed().as_millis();
        log::debug!(
            "Finished {} request to: {}, status: {}, total_duration: {}ms, success: {}",
            method,
            uri,
            status_code,
            duration,
            success
        );
        result
    }

    async fn private_execute_request(
        &self,
        start_time: Instant,
        method: &str,
        uri: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        log::debug!("Starting {} request to: {}", method, uri);
        let result = self.0.http_client.request(req).await;
        let duration = start_time.elapsed().as_millis();
        match result {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    status_code,
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(err.into())
            }
        }
    }

    async fn read_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
        if !response.status().is_success() {
            return Err(Error::http(response.status()));
        }

        let deserialized = if log::log_enabled!(log::Level::Trace) {
            // the body can only be read once, so read it all into one buffer in order to log it
            let body = hyper::body::to_bytes(response.into_body()).await?;
            let as_str = String::from_utf8_lossy(body.as_ref());
            log::trace!("Got response body: {}", as_str);
            serde_json::from_slice(body.as_ref())?
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            serde_json::from_reader(body.reader())?
        };
        Ok(deserialized)
    }
}

#[async_trait]
impl ClusterApi for Client {
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        self.list_all(k8s_type, namespace).await
    }

    async fn watch(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, Error> {
        let lines = self
            .watch_lines(k8s_type, namespace, resource_version)
            .await?;
        let events = stream::unfold(lines, |mut lines| async move {
            lines.next().await.map(|event| (event, lines))
        });
        Ok(events.boxed())
    }

    async fn container_logs(
        &self,
        pod: ObjectIdRef<'_>,
        container: &str,
    ) -> Result<Option<String>, Error> {
        self.get_logs(&pod, container).await
    }

    async fn pod_metrics(&self, pod: ObjectIdRef<'_>) -> Result<Option<K8sResource>, Error> {
        let value = self
            .get_resource(k8s_types::metrics_k8s_io::v1beta1::PodMetrics, &pod)
            .await?;
        match value.map(K8sResource::from_value) {
            Some(Ok(metrics)) => Ok(Some(metrics)),
            Some(Err(err)) => {
                log::warn!("Ignoring malformed pod metrics for {}: {}", pod, err);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

pub struct Lines {
    body: Body,
    remaining: Option<bytes::Bytes>,
    current_line: Vec<bytes::Bytes>,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            remaining: None,
            current_line: Vec::with_capacity(2),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Line<'_>, Error>> {
        self.current_line.clear();

        loop {
            if let Some(mut remaining) = self.remaining.take() {
                let res = {
                    let buf = &remaining[..];
                    Lines::index_of_newline(buf)
                };
                if let Some((start, end)) = res {
                    // found a line in the currrent buffer, so we'll break off a slice
                    let mut line = remaining.split_to(end);
                    if !remaining.is_empty() {
                        self.remaining = Some(remaining);
                    }
                    if start > 0 || !self.current_line.is_empty() {
                        // a chunk may end right before the newline that ends the line
                        if start > 0 {
                            line.truncate(start);
                            self.current_line.push(line);
                        }
                        return Some(Ok(self.make_line()));
                    }
                } else {
                    // no newlines in here, add this slice to the current line and keep looking
                    self.current_line.push(remaining);
                }
            } else {
                let next = self.body.next().await;
                match next {
                    Some(Ok(bytes)) => self.remaining = Some(bytes),
                    Some(Err(e)) => {
                        log::error!("Error reading response lines: {}", e);
                        return Some(Err(e.into()));
                    }
                    None => {
                        if !self.current_line.is_empty() {
                            return Some(Ok(self.make_line()));
                        } else {
                            return None;
                        }
                    }
                }
            }
        }
    }

    fn make_line(&mut self) -> Line {
        Line {
            buffer: self.current_line.as_mut_slice(),
        }
    }

    fn index_of_newline(bytes: &[u8]) -> Option<(usize, usize)> {
        NEWLINE_REGEX.find(bytes).map(|m| (m.start(), m.end()))
    }
}

pub struct Line<'a> {
    buffer: &'a mut [bytes::Bytes],
}

impl<'a> Line<'a> {
    fn is_empty(&self) -> bool {
        self.buffer.iter().map(bytes::Bytes::len).sum::<usize>() == 0usize
    }
}

impl<'a> std::io::Read for Line<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let mut bytes_written = 0;
        let mut dest = buf;

        while !self.buffer.is_empty() && !dest.is_empty() {
            let byte_count = dest.len().min(self.buffer[0].len());

            {
                let src = &(self.buffer[0])[0..byte_count];
                let tmp_dst = &mut dest[0..byte_count];
                tmp_dst.copy_from_slice(src);
                bytes_written += byte_count;
            }
            dest = &mut dest[byte_count..];
            let _ = self.buffer[0].split_to(byte_count);
            if self.buffer[0].is_empty() {
                let tmp: &mut [bytes::Bytes] = std::mem::take(&mut self.buffer);
                self.buffer = &mut tmp[1..];
            }
        }
        Ok(bytes_written)
    }
}

pub struct LineDeserializer<T: DeserializeOwned> {
    lines: Lines,
    _phantom: std::marker::PhantomData<fn() -> T>,
}
impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        Self {
            lines,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        loop {
            let line = self.lines.next().await?;
            match line {
                Ok(reader) if !reader.is_empty() => {
                    return Some(serde_json::from_reader(reader).map_err(Into::into))
                }
                Err(err) => return Some(Err(err)),
                _ => { /* empty line, so we'll loop again */ }
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(ApiError),
}

#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use hyper::Body;
    use std::io::Read;
    use tokio::runtime;

    fn body_of(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks).map(|b| {
            let res: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(b));
            res
        });
        Body::wrap_stream(stream)
    }

    #[test]
    fn lines_iterates_lines() {
        let input1 = &b"line1\nline2\r\nline3\r\n\r\n\r\n\rlong"[..];
        let input2 = &b"line4\r\r"[..];
        let input3 = &b"\r\nline5"[..];
        let mut lines = Lines::from_body(body_of(vec![input1, input2, input3]));

        let runtime = runtime::Builder::new_current_thread().build().unwrap();

        let expected = ["line1", "line2", "line3", "longline4", "line5"];

        runtime.block_on(async move {
            for expected_line in expected.iter() {
                let mut line = lines
                    .next()
                    .await
                    .expect("line returned none")
                    .expect("line returned error");
                let mut string = String::new();
                line.read_to_string(&mut string)
                    .expect("failed to read to string");
                assert_eq!(*expected_line, string.as_str());
                assert!(line.is_empty());
            }
        });
    }

    #[test]
    fn watch_events_are_deserialized_from_lines() {
        let _ = env_logger::try_init();
        let input1 = &br#"{"type":"ADDED","object":{"metadata":{"name":"web-1"}}}"#[..];
        let input2 = &b"\n\n"[..];
        let input3 = &br#"{"type":"ERROR","object":{"status":"Failure","code":410,"reason":"Expired"}}"#[..];
        let lines = Lines::from_body(body_of(vec![input1, input2, input3]));
        let mut events = LineDeserializer::<WatchEvent>::new(lines);

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async move {
            let first = events.next().await.unwrap().unwrap();
            assert_eq!(
                WatchEvent::Added(serde_json::json!({"metadata": {"name": "web-1"}})),
                first
            );
            match events.next().await.unwrap().unwrap() {
                WatchEvent::Error(err) => assert_eq!(410, err.code),
                other => panic!("expected an error event, got: {:?}", other),
            }
            assert!(events.next().await.is_none());
        });
    }

    #[test]
    fn chunk_ending_right_before_a_newline_keeps_events_apart() {
        let _ = env_logger::try_init();
        let input1 = &br#"{"type":"ADDED","object":{"metadata":{"name":"web-1"}}}"#[..];
        let input2 = &b"\n{\"type\":\"MODIFIED\",\"object\":{\"metadata\":{\"name\":\"web-1\"}}}\n"[..];
        let input3 = &br#"{"type":"DELETED","object":{"metadata":{"name":"web-1"}}}"#[..];
        let input4 = &b"\r\n"[..];
        let lines = Lines::from_body(body_of(vec![input1, input2, input3, input4]));
        let mut events = LineDeserializer::<WatchEvent>::new(lines);

        let object = serde_json::json!({"metadata": {"name": "web-1"}});
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async move {
            assert_eq!(WatchEvent::Added(object.clone()), events.next().await.unwrap().unwrap());
            assert_eq!(WatchEvent::Modified(object.clone()), events.next().await.unwrap().unwrap());
            assert_eq!(WatchEvent::Deleted(object), events.next().await.unwrap().unwrap());
            assert!(events.next().await.is_none());
        });
    }
}
