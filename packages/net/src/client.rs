//! The `http-client` capability.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use capbridge_core::{Deadline, Error, Result, Value};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::executor::{HttpExecutor, ReqwestExecutor, TransportOptions};
use crate::types::{HttpRequest, HttpResponse, Method};

pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Options a script passes when it asks for an HTTP client.
///
/// Two clients with equal configuration are the same capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_ms: u64,
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    #[serde(alias = "isSkipInsecureVerify")]
    pub skip_insecure_verify: bool,
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            base_url: None,
            headers: BTreeMap::new(),
            proxy: None,
            skip_insecure_verify: false,
            follow_redirects: true,
        }
    }
}

impl HttpClientConfig {
    fn transport(&self) -> TransportOptions {
        TransportOptions {
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            proxy: self.proxy.clone(),
            accept_invalid_certs: self.skip_insecure_verify,
            follow_redirects: self.follow_redirects,
        }
    }
}

/// Blocking HTTP client shared by every script with the same configuration.
pub struct HttpClient {
    config: HttpClientConfig,
    base: Option<Url>,
    executor: Arc<dyn HttpExecutor>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let executor = ReqwestExecutor::new(&config.transport())?;
        Self::with_executor(config, Arc::new(executor))
    }

    pub fn with_executor(config: HttpClientConfig, executor: Arc<dyn HttpExecutor>) -> Result<Self> {
        let base = match &config.base_url {
            Some(raw) => Some(
                Url::parse(raw).map_err(|e| Error::upstream(format!("parse base url {:?}", raw), e))?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            base,
            executor,
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Absolute urls pass through; anything else is joined onto `base_url`.
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base {
                Some(base) => base
                    .join(url)
                    .map_err(|e| Error::upstream(format!("join url {:?}", url), e)),
                None => Err(Error::illegal_state(format!(
                    "relative url {:?} without a base_url",
                    url
                ))),
            },
            Err(e) => Err(Error::upstream(format!("parse url {:?}", url), e)),
        }
    }

    /// Send one request. The effective timeout is the tighter of the
    /// client timeout and `deadline`.
    ///
    /// A `Null` body sends nothing; strings and bytes are sent verbatim;
    /// anything else is sent as JSON.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &Value,
        deadline: &Deadline,
    ) -> Result<HttpResponse> {
        let method: Method = method.parse()?;
        let url = self.resolve_url(url)?;

        let client_deadline = if self.config.timeout_ms > 0 {
            Deadline::after(Duration::from_millis(self.config.timeout_ms))
        } else {
            Deadline::never()
        };
        let effective = deadline.min(&client_deadline);
        if effective.is_expired() {
            return Err(Error::timeout(format!("{} {}", method, url)));
        }

        let mut request = HttpRequest::new(method, url.as_str());
        request.timeout = effective.remaining();
        for (name, value) in self.config.headers.iter().chain(headers.iter()) {
            request.headers.insert(name.clone(), value.clone());
        }
        request.body = match body {
            Value::Null => None,
            Value::String(s) => Some(s.clone().into_bytes()),
            Value::Bytes(b) => Some(b.clone()),
            other => {
                if request.header("content-type").is_none() {
                    request
                        .headers
                        .insert("content-type".into(), "application/json".into());
                }
                Some(other.to_json().to_string().into_bytes())
            }
        };

        self.executor.execute(&request)
    }

    pub fn get(&self, url: &str, deadline: &Deadline) -> Result<HttpResponse> {
        self.request("GET", url, &BTreeMap::new(), &Value::Null, deadline)
    }
}
