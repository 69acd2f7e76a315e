//! The `Transport` interface consumed by `Connection`, plus a default
//! `ureq`-backed implementation. Grounded on `mujmap::remote::HttpWrapper`:
//! agent construction with `redirect_auth_headers`, timeout staging, and
//! trace-gated response body logging via `post_json`'s `log_enabled!`
//! branch.

use std::time::Duration;

use log::{log_enabled, trace, Level};
use snafu::prelude::*;

use crate::wire::{BatchRequest, BatchResponse};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("HTTP request failed: {}", source))]
    Request { source: ureq::Error },

    #[snafu(display("non-2xx HTTP status {}", status))]
    Status { status: http::StatusCode },

    #[snafu(display("could not read response body: {}", source))]
    ReadBody { source: std::io::Error },

    #[snafu(display("could not deserialize response body: {}", source))]
    DeserializeResponse { source: serde_json::Error },

    #[snafu(display("request timed out"))]
    Timeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A JMAP API transport. Exactly the shape spec §6 describes: POST JSON,
/// parse JSON, surface a status code on failure so `failure::classify` can
/// branch on it. `timeout` applies until the request body finishes
/// uploading; `timeout_after_upload` relaxes it afterward (spec §4.3 step 6).
pub trait Transport {
    fn send(
        &self,
        api_url: &str,
        access_token: Option<&str>,
        request: &BatchRequest,
        timeout: Duration,
        timeout_after_upload: Duration,
    ) -> Result<BatchResponse>;
}

/// Default synchronous implementation using `ureq`, mirroring
/// `mujmap::remote::HttpWrapper`.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .redirect_auth_headers(ureq::RedirectAuthHeaders::SameHost)
            .build();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn send(
        &self,
        api_url: &str,
        access_token: Option<&str>,
        request: &BatchRequest,
        timeout: Duration,
        timeout_after_upload: Duration,
    ) -> Result<BatchResponse> {
        // ureq has no separate "before upload" vs. "after upload" timeout
        // knob on a single request; the larger of the two bounds the whole
        // call, matching spec §4.3 step 6's intent that the relaxed
        // post-upload timeout is the one that matters for a large batch.
        let mut req = self
            .agent
            .post(api_url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .timeout(timeout.max(timeout_after_upload));
        if let Some(token) = access_token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }

        let response = req.send_json(request).map_err(|err| match &err {
            ureq::Error::Status(code, _) => {
                let status =
                    http::StatusCode::from_u16(*code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
                Error::Status { status }
            }
            ureq::Error::Transport(transport) if transport.kind() == ureq::ErrorKind::Io => Error::Timeout,
            _ => Error::Request { source: err },
        })?;

        if log_enabled!(Level::Trace) {
            let body = response.into_string().context(ReadBodySnafu {})?;
            trace!("JMAP response body: {body}");
            serde_json::from_str(&body).context(DeserializeResponseSnafu {})
        } else {
            response.into_json().context(ReadBodySnafu {})
        }
    }
}
