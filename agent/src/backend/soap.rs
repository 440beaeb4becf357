//! SOAP backend: POST an XML envelope and surface faults
//!
//! A response carrying a `Fault` element is a failure even when the HTTP
//! status is 2xx; partial data alongside a fault is not returned.

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

use super::{snippet, transport_error};
use crate::error::BackendError;

const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

pub struct SoapBackend {
    client: reqwest::Client,
}

impl SoapBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn execute(
        &self,
        endpoint: Url,
        envelope: String,
        action: Option<&str>,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Vec<u8>, BackendError> {
        debug!("SOAP request to {endpoint} (action: {:?})", action);

        let mut request = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(envelope);
        if let Some(action) = action {
            request = request.header("SOAPAction", format!("\"{action}\""));
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let text = String::from_utf8_lossy(&body);

        if let Some(fault) = find_fault(&text) {
            return Err(BackendError::RemoteFault {
                status: status.as_u16(),
                fault,
            });
        }
        if !status.is_success() {
            return Err(BackendError::RemoteFault {
                status: status.as_u16(),
                fault: snippet(&text),
            });
        }

        Ok(body.to_vec())
    }
}

/// Wrap a body fragment in a SOAP 1.1 envelope unless it already is one
pub fn envelope(body: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with("<?xml") || find_start_tag(trimmed, "Envelope").is_some() {
        return body.to_string();
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{ENVELOPE_NS}\">\
         <soapenv:Header/>\
         <soapenv:Body>{body}</soapenv:Body>\
         </soapenv:Envelope>"
    )
}

/// Fault description when the document contains a SOAP 1.1 or 1.2 `Fault`
pub fn find_fault(xml: &str) -> Option<String> {
    find_start_tag(xml, "Fault")?;
    let detail = ["faultstring", "Text", "Reason", "faultcode"]
        .iter()
        .find_map(|local| element_text(xml, local).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| "SOAP fault".to_string());
    Some(detail)
}

/// Byte offset just past the `>` of the first start tag with this local name
fn find_start_tag(xml: &str, local: &str) -> Option<usize> {
    for (i, _) in xml.match_indices(local) {
        let before = &xml[..i];
        let Some(open) = before.rfind('<') else {
            continue;
        };
        let prefix = &before[open + 1..];
        let prefix_ok = prefix.is_empty()
            || prefix.strip_suffix(':').is_some_and(|p| {
                !p.is_empty() && p.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            });
        let after = &xml[i + local.len()..];
        let boundary_ok = after.starts_with(|c: char| c == '>' || c == '/' || c.is_whitespace());
        if prefix_ok && boundary_ok {
            return after.find('>').map(|end| i + local.len() + end + 1);
        }
    }
    None
}

fn element_text(xml: &str, local: &str) -> Option<String> {
    let start = find_start_tag(xml, local)?;
    let rest = &xml[start..];
    let end = rest.find('<').unwrap_or(rest.len());
    Some(unescape(rest[..end].trim()))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
