//! REST backend: one HTTP request per execution

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use std::time::Duration;
use tracing::debug;

use super::{snippet, transport_error};
use crate::error::BackendError;

pub struct RestBackend {
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn execute(
        &self,
        method: Method,
        endpoint: Url,
        headers: &[(String, String)],
        body: Option<String>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BackendError> {
        debug!("REST {method} {endpoint}");

        let mut request = self.client.request(method, endpoint).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            // Default content-type if not set
            if !headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        if !status.is_success() {
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                body: snippet(&String::from_utf8_lossy(&bytes)),
            });
        }
        Ok(bytes.to_vec())
    }
}

/// Parse a configured HTTP method name
pub fn parse_method(name: &str) -> Option<Method> {
    match name.trim().to_ascii_uppercase().as_str() {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "PATCH" => Some(Method::PATCH),
        "DELETE" => Some(Method::DELETE),
        "HEAD" => Some(Method::HEAD),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get"), Some(Method::GET));
        assert_eq!(parse_method("POST"), Some(Method::POST));
        assert_eq!(parse_method("Delete"), Some(Method::DELETE));
        assert_eq!(parse_method("CONNECT"), None);
        assert_eq!(parse_method(""), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let backend = RestBackend::new(reqwest::Client::new());
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/status")).unwrap();
        let err = backend
            .execute(Method::GET, url, &[], None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)), "got {err:?}");
    }
}
