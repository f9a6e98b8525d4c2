use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use url::Url;

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(timeout) = timeout_seconds {
            let as_str = format!("{}", timeout);
            query.append_pair("timeoutSeconds", &as_str);
        }
    }
    make_req(url, Method::GET, client_config)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, namespace, None)?;
    make_req(url, Method::GET, client_config)
}

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    make_req(url, Method::GET, client_config)
}

/// Request for the plain text logs of one container of a pod
pub fn logs_request(
    client_config: &ClientConfig,
    pod_type: &K8sType,
    pod: &ObjectIdRef<'_>,
    container: &str,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, pod_type, pod.namespace(), Some(pod.name()))?;
    url.path_segments_mut()
        .map_err(|_| Error::endpoint(client_config))?
        .push("log");
    url.query_pairs_mut().append_pair("container", container);
    make_req(url, Method::GET, client_config)
}

fn make_req(
    url: Url,
    method: Method,
    client_config: &ClientConfig,
) -> Result<Request<Body>, Error> {
    let req = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(
            header::AUTHORIZATION,
            client_config.service_account_token.as_str(),
        )
        .header(header::USER_AGENT, client_config.user_agent.as_str())
        .body(Body::empty())?;
    Ok(req)
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, Error> {
    let mut url = Url::parse(client_config.api_server_endpoint.as_str())
        .map_err(|_| Error::endpoint(client_config))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::endpoint(client_config))?;
        segments.pop_if_empty();

        let group = k8s_type.group();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(k8s_type.version());
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;

    fn config() -> ClientConfig {
        ClientConfig::new("https://api.test:6443", "token", "kubemirror-test")
    }

    #[test]
    fn urls_for_core_and_grouped_types() {
        let pods = make_url(&config(), k8s_types::core::v1::Pod, Some("default"), None).unwrap();
        assert_eq!("https://api.test:6443/api/v1/namespaces/default/pods", pods.as_str());

        let usage = make_url(
            &config(),
            k8s_types::metrics_k8s_io::v1beta1::PodMetrics,
            Some("default"),
            Some("web-1"),
        )
        .unwrap();
        assert_eq!(
            "https://api.test:6443/apis/metrics.k8s.io/v1beta1/namespaces/default/pods/web-1",
            usage.as_str()
        );

        let all = make_url(&config(), k8s_types::core::v1::PersistentVolumeClaim, None, None).unwrap();
        assert_eq!("https://api.test:6443/api/v1/persistentvolumeclaims", all.as_str());
    }

    #[test]
    fn logs_request_addresses_the_container() {
        let pod = ObjectIdRef::new("default", "web-1");
        let req = logs_request(&config(), k8s_types::core::v1::Pod, &pod, "nginx").unwrap();
        assert_eq!(
            "https://api.test:6443/api/v1/namespaces/default/pods/web-1/log?container=nginx",
            req.uri().to_string()
        );
        assert_eq!("Bearer token", req.headers()[header::AUTHORIZATION]);
    }

    #[test]
    fn watch_request_resumes_from_resource_version() {
        let req = watch_request(&config(), k8s_types::core::v1::Pod, Some("42"), None, None).unwrap();
        assert_eq!(
            "https://api.test:6443/api/v1/pods?watch=true&resourceVersion=42",
            req.uri().to_string()
        );
    }

    #[test]
    fn invalid_endpoint_is_an_error() {
        let config = ClientConfig::new("not a url", "token", "kubemirror-test");
        assert!(list_request(&config, k8s_types::core::v1::Pod, None).is_err());
    }
}
