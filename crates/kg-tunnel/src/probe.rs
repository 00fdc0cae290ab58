//! Connectivity test through a running tunnel

use std::time::Duration;

use tokio::net::TcpStream;

use kg_core::error::SessionError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of probing a local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing accepted a TCP connection
    CannotConnect,
    /// Connected, but the HTTP request failed or returned an empty body
    NoResponse,
    /// The application answered with this body
    Responded(String),
}

impl ProbeOutcome {
    pub fn into_result(self, port: u16) -> Result<String, SessionError> {
        match self {
            ProbeOutcome::CannotConnect => Err(SessionError::CannotConnect(port)),
            ProbeOutcome::NoResponse => Err(SessionError::NoResponse(port)),
            ProbeOutcome::Responded(body) => Ok(body),
        }
    }
}

/// Probe `127.0.0.1:<port>` with the default bounds
pub async fn probe(port: u16) -> ProbeOutcome {
    probe_with(port, CONNECT_TIMEOUT, HTTP_TIMEOUT).await
}

/// Raw TCP connect, then `GET /` if the connect succeeded
pub async fn probe_with(port: u16, connect_timeout: Duration, http_timeout: Duration) -> ProbeOutcome {
    let address = format!("127.0.0.1:{}", port);

    match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => {}
        Ok(Err(e)) => {
            tracing::debug!("Connect to {} failed: {}", address, e);
            return ProbeOutcome::CannotConnect;
        }
        Err(_) => {
            tracing::debug!("Connect to {} timed out", address);
            return ProbeOutcome::CannotConnect;
        }
    }

    // The request must reach the tunnel, never a proxy from the environment
    let client = match reqwest::Client::builder()
        .no_proxy()
        .timeout(http_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::debug!("Failed to build HTTP client: {}", e);
            return ProbeOutcome::NoResponse;
        }
    };

    let url = format!("http://{}/", address);
    let body = match client.get(&url).send().await {
        Ok(response) => response.text().await,
        Err(e) => Err(e),
    };

    match body {
        Ok(body) if !body.trim().is_empty() => ProbeOutcome::Responded(body),
        Ok(_) => ProbeOutcome::NoResponse,
        Err(e) => {
            tracing::debug!("GET {} failed: {}", url, e);
            ProbeOutcome::NoResponse
        }
    }
}
