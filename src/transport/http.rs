use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;

use super::{Command, ErrorKind, ExecResult, Transport, TransportError, TransportInfo};

#[derive(Debug, Clone)]
pub enum HttpAuth {
    Token(String),
    Header { name: String, value: String },
    /// Client certificate and PKCS#8 key, both PEM.
    Certificate { cert_pem: PathBuf, key_pem: PathBuf },
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub auth: HttpAuth,
    pub ca_bundle: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub timeout: Duration,
}

impl HttpConfig {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            auth: HttpAuth::Token(token.into()),
            ca_bundle: None,
            insecure_skip_verify: false,
            timeout: Duration::from_secs(30),
        }
    }
}

struct HttpState {
    target: String,
    connected: bool,
}

/// HTTP transport against a node agent exposing the execute/upload/download
/// API. Reachability is probed with `GET /health` on connect.
pub struct HttpTransport {
    config: HttpConfig,
    client: reqwest::Client,
    state: Mutex<HttpState>,
}

fn request_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::new(ErrorKind::Timeout, err.to_string())
    } else if err.is_connect() {
        TransportError::new(ErrorKind::ConnectionFailed, err.to_string())
    } else {
        TransportError::new(ErrorKind::CommandFailed, err.to_string())
    }
}

fn status_error(status: reqwest::StatusCode, context: &str) -> TransportError {
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::FileNotFound,
        _ => ErrorKind::CommandFailed,
    };
    TransportError::with_code(kind, format!("{context}: HTTP {status}"), status.as_u16() as i32)
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(bundle) = &config.ca_bundle {
            let pem = std::fs::read(bundle).map_err(|e| {
                TransportError::new(ErrorKind::InvalidTarget, format!("ca bundle: {e}"))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                TransportError::new(ErrorKind::InvalidTarget, format!("ca bundle: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let HttpAuth::Certificate { cert_pem, key_pem } = &config.auth {
            let cert = std::fs::read(cert_pem).map_err(|e| {
                TransportError::new(ErrorKind::Auth, format!("client certificate: {e}"))
            })?;
            let key = std::fs::read(key_pem).map_err(|e| {
                TransportError::new(ErrorKind::Auth, format!("client key: {e}"))
            })?;
            let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key).map_err(|e| {
                TransportError::new(ErrorKind::Auth, format!("client identity: {e}"))
            })?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::new(ErrorKind::ConnectionFailed, e.to_string()))?;
        Ok(Self {
            config,
            client,
            state: Mutex::new(HttpState {
                target: String::new(),
                connected: false,
            }),
        })
    }

    fn target(&self) -> Result<String, TransportError> {
        let state = self.state.lock().expect("http state poisoned");
        if !state.connected {
            return Err(TransportError::new(
                ErrorKind::NotConnected,
                "transport is not connected",
            ));
        }
        Ok(state.target.clone())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            HttpAuth::Token(token) => request.bearer_auth(token),
            HttpAuth::Header { name, value } => request.header(name.as_str(), value.as_str()),
            // Certificate auth lives in the client's TLS identity.
            HttpAuth::Certificate { .. } => request,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        if !target.starts_with("http://") && !target.starts_with("https://") {
            return Err(TransportError::new(
                ErrorKind::InvalidTarget,
                format!("target {target} must start with http:// or https://"),
            ));
        }
        let target = target.trim_end_matches('/').to_string();
        let response = self
            .apply_auth(self.client.get(format!("{target}/health")))
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "health probe"));
        }
        let mut state = self.state.lock().expect("http state poisoned");
        state.target = target;
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("http state poisoned");
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().expect("http state poisoned").connected
    }

    async fn execute(&self, command: &Command) -> Result<ExecResult, TransportError> {
        let target = self.target()?;
        let response = self
            .apply_auth(self.client.post(format!("{target}/api/v1/execute")))
            .json(command)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "execute"));
        }
        response
            .json::<ExecResult>()
            .await
            .map_err(|e| TransportError::new(ErrorKind::CommandFailed, e.to_string()))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let target = self.target()?;
        let contents = tokio::fs::read(local).await.map_err(|e| {
            TransportError::new(ErrorKind::FileNotFound, format!("{}: {e}", local.display()))
        })?;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(contents).file_name(file_name))
            .text("path", remote.to_string());
        let response = self
            .apply_auth(self.client.post(format!("{target}/api/v1/upload")))
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "upload"));
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let target = self.target()?;
        let response = self
            .apply_auth(
                self.client
                    .get(format!("{target}/api/v1/download"))
                    .query(&[("path", remote)]),
            )
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "download"));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(ErrorKind::CommandFailed, e.to_string()))?;
        tokio::fs::write(local, &body)
            .await
            .map_err(|e| TransportError::new(ErrorKind::PermissionDenied, e.to_string()))?;
        Ok(())
    }

    fn info(&self) -> TransportInfo {
        let state = self.state.lock().expect("http state poisoned");
        TransportInfo {
            protocol: "http",
            target: state.target.clone(),
            connected: state.connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_target() {
        let transport = HttpTransport::new(HttpConfig::with_token("t")).unwrap();
        let err = transport.connect("ssh://nope").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[tokio::test]
    async fn execute_before_connect_is_not_connected() {
        let transport = HttpTransport::new(HttpConfig::with_token("t")).unwrap();
        let err = transport
            .execute(&Command::shell("true"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }
}
