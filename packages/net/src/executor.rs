//! HTTP execution seam.
//!
//! [`HttpClient`](crate::HttpClient) builds a fully resolved
//! [`HttpRequest`] and hands it to an [`HttpExecutor`]. Production uses
//! [`ReqwestExecutor`]; tests swap in [`mock::MockExecutor`].

use std::collections::BTreeMap;
use std::time::Duration;

use capbridge_core::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::types::{HttpRequest, HttpResponse};

pub trait HttpExecutor: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Transport options fixed when the client is built.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
    pub accept_invalid_certs: bool,
    pub follow_redirects: bool,
}

pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let mut builder = Client::builder().danger_accept_invalid_certs(options.accept_invalid_certs);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| Error::upstream(format!("configure proxy {:?}", proxy), e))?;
            builder = builder.proxy(proxy);
        }
        if !options.follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }

        let client = builder
            .build()
            .map_err(|e| Error::upstream("build http client", e))?;
        Ok(Self { client })
    }
}

fn transport_error(request: &HttpRequest, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(format!("{} {}", request.method, request.url))
    } else {
        Error::upstream(format!("{} {}", request.method, request.url), e)
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::upstream(format!("header name {:?}", name), e))?;
            let header_value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::upstream(format!("header value for {:?}", name), e))?;
            headers.insert(header_name, header_value);
        }

        let mut req_builder = self
            .client
            .request(request.method.into(), &request.url)
            .headers(headers);
        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .map_err(|e| transport_error(request, e))?;

        let status = response.status().as_u16();
        let mut resp_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                resp_headers.insert(name.to_string(), v.to_string());
            }
        }
        let data = response
            .bytes()
            .map_err(|e| transport_error(request, e))?
            .to_vec();

        tracing::debug!(method = %request.method, url = %request.url, status, bytes = data.len(), "http request finished");
        Ok(HttpResponse {
            status,
            headers: resp_headers,
            data,
        })
    }
}

/// Mock HTTP executor for testing.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Returns canned responses by url and records every request.
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        responses: Arc<Mutex<HashMap<String, HttpResponse>>>,
        recorded_requests: Arc<Mutex<Vec<HttpRequest>>>,
        failure: Arc<Mutex<Option<String>>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_response(self, url: impl Into<String>, response: HttpResponse) -> Self {
            self.responses.lock().unwrap().insert(url.into(), response);
            self
        }

        pub fn fail_with(self, message: impl Into<String>) -> Self {
            *self.failure.lock().unwrap() = Some(message.into());
            self
        }

        pub fn recorded_requests(&self) -> Vec<HttpRequest> {
            self.recorded_requests.lock().unwrap().clone()
        }
    }

    impl HttpExecutor for MockExecutor {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.recorded_requests.lock().unwrap().push(request.clone());

            if let Some(message) = self.failure.lock().unwrap().clone() {
                return Err(Error::upstream("mock transport", message));
            }

            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .unwrap_or_else(|| HttpResponse::new(404)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExecutor;
    use super::*;

    #[test]
    fn mock_executor_returns_configured_response() {
        let mut canned = HttpResponse::new(200);
        canned.data = b"pong".to_vec();
        let executor = MockExecutor::new().with_response("http://svc/ping", canned);

        let result = executor.execute(&HttpRequest::get("http://svc/ping")).unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.text(), "pong");
    }

    #[test]
    fn mock_executor_returns_404_when_no_match() {
        let executor = MockExecutor::new();
        let result = executor.execute(&HttpRequest::get("http://svc/unknown")).unwrap();
        assert_eq!(result.status, 404);
    }

    #[test]
    fn mock_executor_failure_is_upstream() {
        let executor = MockExecutor::new().fail_with("connection refused");
        let err = executor.execute(&HttpRequest::get("http://svc/")).unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }

    #[test]
    fn reqwest_executor_creation() {
        let options = TransportOptions {
            timeout: Some(Duration::from_secs(30)),
            follow_redirects: true,
            ..Default::default()
        };
        assert!(ReqwestExecutor::new(&options).is_ok());
    }
}
