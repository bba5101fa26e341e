//! Renders a behavior's request template and performs the HTTP call.

use crate::context::Context;
use crate::error::ExecutionError;
use crate::model::{ExecutionResult, HttpMethod, RequestTemplate, SpecConfig};
use crate::policy;
use reqwest::redirect::Policy;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use url::Url;

/// Settings the executor needs for every request of a run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub default_headers: HashMap<String, String>,
    /// Permit loopback/private/link-local targets.
    pub allow_local_targets: bool,
}

impl ExecutorConfig {
    pub fn from_spec(config: &SpecConfig, allow_local_targets: bool) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            default_headers: config.headers.clone(),
            allow_local_targets,
        }
    }
}

/// A request with every placeholder filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRequest {
    pub method: HttpMethod,
    pub path: String,
    pub url: Url,
    /// Header name (as written) to value, one entry per
    /// case-insensitive name.
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Sends behavior requests. Never retries.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Executor with a client that does not follow redirects, so a 3xx
    /// cannot bounce a request past the address policy.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().redirect(Policy::none()).build()?;
        Ok(Self { client })
    }

    /// Use a caller-built client. It should not follow redirects.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Render, police and send one request.
    #[instrument(
        skip(self, template, ctx, config),
        fields(method = %template.method, path = %template.path)
    )]
    pub async fn execute(
        &self,
        template: &RequestTemplate,
        ctx: &Context,
        config: &ExecutorConfig,
    ) -> Result<ExecutionResult, ExecutionError> {
        let rendered = render_request(template, ctx, config)?;
        let method = rendered.method.as_str().to_string();
        let url = rendered.url.to_string();

        enforce_policy(&rendered.url, &method, config.allow_local_targets, config.timeout).await?;

        let mut req_builder = self
            .client
            .request(convert_method(&rendered.method), rendered.url.clone())
            .timeout(config.timeout);
        for (name, value) in &rendered.headers {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &rendered.body {
            req_builder = req_builder.json(body);
        }

        debug!("Sending {} {}", method, url);
        let start = Instant::now();
        let response = req_builder
            .send()
            .await
            .map_err(|err| transport_error(&method, &url, &err, config.timeout))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        let raw_body = response
            .text()
            .await
            .map_err(|err| transport_error(&method, &url, &err, config.timeout))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!("Received status {} in {} ms", status, elapsed_ms);

        let is_json = headers
            .get("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        let body = if is_json && !raw_body.trim().is_empty() {
            let parsed = serde_json::from_str::<Value>(&raw_body).map_err(|err| {
                ExecutionError::ResponseParse {
                    message: err.to_string(),
                    raw: raw_body.clone(),
                }
            })?;
            Some(parsed)
        } else {
            None
        };

        Ok(ExecutionResult {
            status,
            headers,
            body,
            raw_body,
            elapsed_ms,
            method,
            url,
            path: rendered.path,
            request_body: rendered.body,
        })
    }
}

/// Resolve every part of the template against `ctx` and build the URL.
pub fn render_request(
    template: &RequestTemplate,
    ctx: &Context,
    config: &ExecutorConfig,
) -> Result<RenderedRequest, ExecutionError> {
    let path = ctx.resolve(&template.path)?;

    let mut headers = merge_headers(&config.default_headers, &template.headers);
    for (_, value) in headers.iter_mut() {
        *value = ctx.resolve(value)?;
    }

    let mut query = Vec::with_capacity(template.query.len());
    for (key, value) in &template.query {
        query.push((key.clone(), ctx.resolve(value)?));
    }

    let body = template
        .body
        .as_ref()
        .map(|body| ctx.resolve_value(body))
        .transpose()?;

    let url = build_url(&config.base_url, &path, &query)?;

    Ok(RenderedRequest {
        method: template.method,
        path,
        url,
        headers,
        body,
    })
}

/// Defaults first, then request headers replacing any default with the
/// same case-insensitive name. Sorted by lowercase name.
pub fn merge_headers(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (name, value) in defaults {
        merged.insert(name.to_ascii_lowercase(), (name.clone(), value.clone()));
    }
    for (name, value) in overrides {
        merged.insert(name.to_ascii_lowercase(), (name.clone(), value.clone()));
    }
    merged.into_values().collect()
}

/// Join `path` onto `base_url` and append query parameters.
///
/// A `path` that parses on its own as a hierarchical URL
/// (`scheme://...`) is used as-is; anything else is relative.
pub fn build_url(
    base_url: &str,
    path: &str,
    query: &[(String, String)],
) -> Result<Url, ExecutionError> {
    let absolute = Url::parse(path).ok().filter(|url| !url.cannot_be_a_base());
    let raw = if let Some(url) = absolute {
        url.to_string()
    } else if base_url.is_empty() {
        return Err(ExecutionError::UrlParse {
            url: path.to_string(),
            message: "relative path with no base_url configured".to_string(),
        });
    } else if path.is_empty() {
        base_url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&raw).map_err(|err| ExecutionError::UrlParse {
        url: raw.clone(),
        message: err.to_string(),
    })?;

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Apply the address policy, resolving domain names first.
///
/// Name resolution counts against the request timeout.
async fn enforce_policy(
    url: &Url,
    method: &str,
    allow_local: bool,
    timeout: Duration,
) -> Result<(), ExecutionError> {
    let blocked = |reason: String| ExecutionError::SsrfBlocked {
        url: url.to_string(),
        reason,
    };

    let domain = policy::check_url(url, allow_local).map_err(|v| blocked(v.reason))?;
    let Some(host) = domain else {
        return Ok(());
    };
    if allow_local {
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let request_error = |message: String| ExecutionError::HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        message,
    };
    let lookup = tokio::net::lookup_host((host.as_str(), port));
    let addrs = resolve_within(&host, timeout, lookup).await.map_err(request_error)?;
    if addrs.is_empty() {
        return Err(request_error(format!("host '{host}' has no resolved addresses")));
    }
    for addr in addrs {
        policy::check_ip(&host, addr.ip(), allow_local).map_err(|v| blocked(v.reason))?;
    }
    Ok(())
}

/// Await a name lookup, giving up after `timeout`.
async fn resolve_within<F, I>(
    host: &str,
    timeout: Duration,
    lookup: F,
) -> Result<Vec<SocketAddr>, String>
where
    F: Future<Output = std::io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => Ok(addrs.collect()),
        Ok(Err(err)) => Err(format!("failed to resolve host '{host}': {err}")),
        Err(_) => Err(format!(
            "timed out after {} ms resolving host '{host}'",
            timeout.as_millis()
        )),
    }
}

fn transport_error(
    method: &str,
    url: &str,
    err: &reqwest::Error,
    timeout: Duration,
) -> ExecutionError {
    let message = if err.is_timeout() {
        format!("timed out after {} ms", timeout.as_millis())
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    ExecutionError::HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        message,
    }
}

fn convert_method(method: &HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterpolationError;
    use serde_json::json;

    fn config(base_url: &str) -> ExecutorConfig {
        ExecutorConfig {
            base_url: base_url.to_string(),
            timeout: Duration::from_millis(500),
            default_headers: HashMap::from([
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Client".to_string(), "intent".to_string()),
            ]),
            allow_local_targets: false,
        }
    }

    fn template(path: &str) -> RequestTemplate {
        RequestTemplate {
            method: HttpMethod::Get,
            path: path.to_string(),
            headers: HashMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    // ── build_url ───────────────────────────────────────

    #[test]
    fn test_build_url_joins_base_path_prefix() {
        let url = build_url("https://api.example.com/v1/", "/users/7", &[]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/7");
    }

    #[test]
    fn test_build_url_appends_query() {
        let query = vec![
            ("page".to_string(), "2".to_string()),
            ("q".to_string(), "a b&c".to_string()),
        ];
        let url = build_url("https://api.example.com", "/search?lang=en", &query).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/search?lang=en&page=2&q=a+b%26c"
        );
    }

    #[test]
    fn test_build_url_embedded_scheme_stays_relative() {
        let url = build_url(
            "https://api.example.com",
            "/login?next=https://app.example.com/home",
            &[],
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
        assert_eq!(url.path(), "/login");
        assert_eq!(
            url.query_pairs().next(),
            Some(("next".into(), "https://app.example.com/home".into()))
        );

        let url = build_url("https://api.example.com", "/proxy/http://inner/x", &[]).unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));

        let url = build_url("https://api.example.com", "users:list", &[]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/users:list");
    }

    #[test]
    fn test_build_url_absolute_path_replaces_base() {
        let url = build_url("https://api.example.com", "https://other.example.com/x", &[]).unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/x");
        // Non-http schemes still reach the address policy.
        let url = build_url("https://api.example.com", "file:///etc/passwd", &[]).unwrap();
        assert_eq!(url.scheme(), "file");
    }

    #[test]
    fn test_build_url_errors() {
        assert!(matches!(
            build_url("", "/users", &[]),
            Err(ExecutionError::UrlParse { .. })
        ));
        assert!(matches!(
            build_url("not a url", "/users", &[]),
            Err(ExecutionError::UrlParse { .. })
        ));
    }

    // ── render_request ──────────────────────────────────

    #[test]
    fn test_merge_headers_case_insensitive_override() {
        let overrides = HashMap::from([("accept".to_string(), "text/plain".to_string())]);
        let merged = merge_headers(&config("").default_headers, &overrides);
        assert_eq!(
            merged,
            vec![
                ("accept".to_string(), "text/plain".to_string()),
                ("X-Client".to_string(), "intent".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_request_interpolates_everything() {
        let mut ctx = Context::new();
        ctx.set("user_id", json!("u-1"));
        ctx.set("token", json!("abc"));
        ctx.set("age", json!(30));

        let mut tpl = template("/users/${user_id}");
        tpl.method = HttpMethod::Put;
        tpl.headers
            .insert("Authorization".into(), "Bearer ${token}".into());
        tpl.query.insert("expand".into(), "${user_id}".into());
        tpl.body = Some(json!({"age": "${age}", "note": "id ${user_id}"}));

        let rendered = render_request(&tpl, &ctx, &config("https://api.example.com")).unwrap();
        assert_eq!(rendered.path, "/users/u-1");
        assert_eq!(
            rendered.url.as_str(),
            "https://api.example.com/users/u-1?expand=u-1"
        );
        assert!(rendered
            .headers
            .contains(&("Authorization".to_string(), "Bearer abc".to_string())));
        assert_eq!(rendered.body, Some(json!({"age": 30, "note": "id u-1"})));
    }

    #[test]
    fn test_render_request_propagates_interpolation_failure() {
        let ctx = Context::new();
        let err = render_request(&template("/users/${user_id}"), &ctx, &config("https://x.io"))
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Interpolation(InterpolationError::Undefined { .. })
        ));
    }

    // ── execute policy ──────────────────────────────────

    #[tokio::test]
    async fn test_loopback_target_blocked_without_override() {
        let executor = HttpExecutor::new().unwrap();
        let ctx = Context::new();
        let err = executor
            .execute(&template("/health"), &ctx, &config("http://127.0.0.1:9"))
            .await
            .unwrap_err();
        match err {
            ExecutionError::SsrfBlocked { url, reason } => {
                assert_eq!(url, "http://127.0.0.1:9/health");
                assert!(reason.contains("loopback"));
            }
            other => panic!("expected SsrfBlocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_localhost_name_blocked_without_override() {
        let executor = HttpExecutor::new().unwrap();
        let err = executor
            .execute(&template("/"), &Context::new(), &config("http://localhost:9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ssrf_blocked");
    }

    #[tokio::test]
    async fn test_name_lookup_bounded_by_timeout() {
        let stalled = std::future::pending::<std::io::Result<std::vec::IntoIter<SocketAddr>>>();
        let err = resolve_within("api.example.com", Duration::from_millis(20), stalled)
            .await
            .unwrap_err();
        assert_eq!(err, "timed out after 20 ms resolving host 'api.example.com'");
    }

    #[tokio::test]
    async fn test_name_lookup_collects_addresses() {
        let addr: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let resolved = async move { Ok(vec![addr].into_iter()) };
        let addrs = resolve_within("api.example.com", Duration::from_secs(1), resolved)
            .await
            .unwrap();
        assert_eq!(addrs, vec![addr]);
    }
}
