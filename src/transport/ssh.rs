use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::Session;

use super::{Command, ErrorKind, ExecResult, Transport, TransportError, TransportInfo};

#[derive(Debug, Clone)]
pub enum SshAuth {
    Key {
        username: String,
        key_path: Option<PathBuf>,
        key_data: Option<String>,
    },
    Password {
        username: String,
        password: String,
    },
}

impl SshAuth {
    fn username(&self) -> &str {
        match self {
            SshAuth::Key { username, .. } => username,
            SshAuth::Password { username, .. } => username,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub auth: SshAuth,
    /// The knob exists but is not wired to a known-hosts store; host keys
    /// are currently accepted without verification.
    pub strict_host_key_checking: bool,
    pub timeout: Duration,
}

impl SshConfig {
    pub fn with_key(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            auth: SshAuth::Key {
                username: username.into(),
                key_path: Some(key_path.into()),
                key_data: None,
            },
            strict_host_key_checking: false,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            auth: SshAuth::Password {
                username: username.into(),
                password: password.into(),
            },
            strict_host_key_checking: false,
            timeout: Duration::from_secs(30),
        }
    }
}

struct SshState {
    session: Option<Session>,
    target: String,
}

/// SSH transport. Each `execute` opens a fresh session channel; the
/// underlying `ssh2` calls are blocking and run on the blocking pool.
pub struct SshTransport {
    config: SshConfig,
    state: Arc<Mutex<SshState>>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SshState {
                session: None,
                target: String::new(),
            })),
        }
    }
}

fn parse_target(target: &str) -> Result<(String, u16), TransportError> {
    if target.trim().is_empty() {
        return Err(TransportError::new(
            ErrorKind::InvalidTarget,
            "empty ssh target",
        ));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                TransportError::new(
                    ErrorKind::InvalidTarget,
                    format!("invalid port in target {target}"),
                )
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), 22)),
    }
}

fn io_error(err: &std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::new(ErrorKind::Timeout, err.to_string())
        }
        std::io::ErrorKind::NotFound => {
            TransportError::new(ErrorKind::FileNotFound, err.to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            TransportError::new(ErrorKind::PermissionDenied, err.to_string())
        }
        _ => TransportError::new(ErrorKind::ConnectionFailed, err.to_string()),
    }
}

fn ssh_error(err: &ssh2::Error, default: ErrorKind) -> TransportError {
    // libssh2 reports blocking-timeout exhaustion as LIBSSH2_ERROR_TIMEOUT.
    if matches!(err.code(), ssh2::ErrorCode::Session(-9)) {
        return TransportError::new(ErrorKind::Timeout, err.to_string());
    }
    TransportError::new(default, err.to_string())
}

fn open_session(config: &SshConfig, target: &str) -> Result<Session, TransportError> {
    let (host, port) = parse_target(target)?;
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| TransportError::new(ErrorKind::InvalidTarget, e.to_string()))?
        .next()
        .ok_or_else(|| {
            TransportError::new(
                ErrorKind::InvalidTarget,
                format!("target {target} did not resolve"),
            )
        })?;

    let tcp = TcpStream::connect_timeout(&addr, config.timeout).map_err(|e| io_error(&e))?;
    let mut session = Session::new()
        .map_err(|e| ssh_error(&e, ErrorKind::ConnectionFailed))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| ssh_error(&e, ErrorKind::ConnectionFailed))?;

    match &config.auth {
        SshAuth::Key {
            username,
            key_path,
            key_data,
        } => {
            if let Some(path) = key_path {
                session
                    .userauth_pubkey_file(username, None, path, None)
                    .map_err(|e| ssh_error(&e, ErrorKind::Auth))?;
            } else if let Some(data) = key_data {
                session
                    .userauth_pubkey_memory(username, None, data, None)
                    .map_err(|e| ssh_error(&e, ErrorKind::Auth))?;
            } else {
                return Err(TransportError::new(
                    ErrorKind::Auth,
                    "ssh key auth requires key_path or key_data",
                ));
            }
        }
        SshAuth::Password { username, password } => {
            session
                .userauth_password(username, password)
                .map_err(|e| ssh_error(&e, ErrorKind::Auth))?;
        }
    }

    if !session.authenticated() {
        return Err(TransportError::new(
            ErrorKind::Auth,
            format!("authentication failed for {}", config.auth.username()),
        ));
    }
    Ok(session)
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        let config = self.config.clone();
        let target_owned = target.to_string();
        let session =
            tokio::task::spawn_blocking(move || open_session(&config, &target_owned))
                .await
                .map_err(|e| TransportError::new(ErrorKind::ConnectionFailed, e.to_string()))??;
        let mut state = self.state.lock().expect("ssh state poisoned");
        state.session = Some(session);
        state.target = target.to_string();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = {
            let mut state = self.state.lock().expect("ssh state poisoned");
            state.session.take()
        };
        if let Some(session) = session {
            let _ = tokio::task::spawn_blocking(move || {
                session.disconnect(None, "closing", None)
            })
            .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().expect("ssh state poisoned").session.is_some()
    }

    async fn execute(&self, command: &Command) -> Result<ExecResult, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::new(
                ErrorKind::NotConnected,
                "execute called before connect",
            ));
        }
        let state = Arc::clone(&self.state);
        let command = command.clone();
        let per_command_timeout = command.timeout;
        let default_timeout = self.config.timeout;
        tokio::task::spawn_blocking(move || {
            let state = state.lock().expect("ssh state poisoned");
            let session = state
                .session
                .as_ref()
                .ok_or_else(|| TransportError::new(ErrorKind::NotConnected, "disconnected"))?;
            if let Some(timeout) = per_command_timeout {
                session.set_timeout(timeout.as_millis() as u32);
            }

            let started = Instant::now();
            let mut channel = session
                .channel_session()
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            channel
                .exec(&command.render())
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            if command.capture_output {
                channel
                    .read_to_string(&mut stdout)
                    .map_err(|e| io_error(&e))?;
                channel
                    .stderr()
                    .read_to_string(&mut stderr)
                    .map_err(|e| io_error(&e))?;
            }
            channel
                .wait_close()
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            if per_command_timeout.is_some() {
                session.set_timeout(default_timeout.as_millis() as u32);
            }

            Ok(ExecResult {
                exit_code,
                stdout,
                stderr,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        })
        .await
        .map_err(|e| TransportError::new(ErrorKind::CommandFailed, e.to_string()))?
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let state = Arc::clone(&self.state);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let contents = std::fs::read(&local).map_err(|e| io_error(&e))?;
            let state = state.lock().expect("ssh state poisoned");
            let session = state
                .session
                .as_ref()
                .ok_or_else(|| TransportError::new(ErrorKind::NotConnected, "disconnected"))?;
            let mut channel = session
                .scp_send(Path::new(&remote), 0o644, contents.len() as u64, None)
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            channel.write_all(&contents).map_err(|e| io_error(&e))?;
            channel.send_eof().map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            channel
                .wait_close()
                .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::new(ErrorKind::CommandFailed, e.to_string()))?
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let state = Arc::clone(&self.state);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || {
            let contents = {
                let state = state.lock().expect("ssh state poisoned");
                let session = state
                    .session
                    .as_ref()
                    .ok_or_else(|| TransportError::new(ErrorKind::NotConnected, "disconnected"))?;
                let (mut channel, _stat) = session
                    .scp_recv(Path::new(&remote))
                    .map_err(|e| ssh_error(&e, ErrorKind::FileNotFound))?;
                let mut contents = Vec::new();
                channel
                    .read_to_end(&mut contents)
                    .map_err(|e| io_error(&e))?;
                channel
                    .wait_close()
                    .map_err(|e| ssh_error(&e, ErrorKind::CommandFailed))?;
                contents
            };
            std::fs::write(&local, contents).map_err(|e| io_error(&e))?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::new(ErrorKind::CommandFailed, e.to_string()))?
    }

    fn info(&self) -> TransportInfo {
        let state = self.state.lock().expect("ssh state poisoned");
        TransportInfo {
            protocol: "ssh",
            target: state.target.clone(),
            connected: state.session.is_some(),
        }
    }
}
