//! Environment configuration and shell resolution.
//!
//! Every setting resolves CLI flag first, then `TERMLINK_*` environment
//! variable, then built-in default:
//!
//! - `TERMLINK_HOST`: listen address (serve) / server address (connect)
//! - `TERMLINK_PORT`: TCP port (default 7070)
//! - `TERMLINK_TOKEN`: shared-secret token (unset: no authentication)
//! - `TERMLINK_SHELL`: shell override for interactive sessions (serve)

use std::env;
use std::path::{Path, PathBuf};

use tracing::warn;

use termlink_core::handshake::CommandSpec;

pub const DEFAULT_PORT: u16 = 7070;
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

/// Daemon-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, handshakes must present exactly this token.
    pub token: Option<String>,
    /// Shell for interactive sessions; overrides `$SHELL`.
    pub shell: Option<String>,
}

impl ServerConfig {
    pub fn resolve(
        host: Option<String>,
        port: Option<u16>,
        token: Option<String>,
        shell: Option<String>,
    ) -> Self {
        Self {
            host: host
                .or_else(|| env_nonempty("TERMLINK_HOST"))
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
            port: port.or_else(env_port).unwrap_or(DEFAULT_PORT),
            token: token.or_else(|| env_nonempty("TERMLINK_TOKEN")),
            shell: shell.or_else(|| env_nonempty("TERMLINK_SHELL")),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    /// Remote command argv; `None` asks the server for a login shell.
    pub cmd: Option<Vec<String>>,
}

impl ClientConfig {
    pub fn resolve(
        host: Option<String>,
        port: Option<u16>,
        token: Option<String>,
        cmd: Vec<String>,
    ) -> Self {
        Self {
            host: host
                .or_else(|| env_nonempty("TERMLINK_HOST"))
                .unwrap_or_else(|| DEFAULT_CONNECT_HOST.to_string()),
            port: port.or_else(env_port).unwrap_or(DEFAULT_PORT),
            token: token.or_else(|| env_nonempty("TERMLINK_TOKEN")),
            cmd: if cmd.is_empty() { None } else { Some(cmd) },
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_port() -> Option<u16> {
    let raw = env_nonempty("TERMLINK_PORT")?;
    match raw.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!("ignoring unparseable TERMLINK_PORT value {:?}", raw);
            None
        }
    }
}

/// Locate an executable on `$PATH`.
fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Shell used to wrap a single command line (`shell -lc <line>`).
fn line_shell() -> String {
    find_on_path("bash")
        .or_else(|| find_on_path("sh"))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Login shell for interactive sessions.
///
/// Priority: server shell override, then `$SHELL`, then `bash`/`sh` from
/// the search path, then `/bin/sh`. Always yields something; a shell that
/// turns out not to exist fails at spawn and is reported to the peer.
fn login_shell(shell_override: Option<&str>) -> String {
    shell_override
        .map(str::to_string)
        .or_else(|| env_nonempty("SHELL"))
        .unwrap_or_else(line_shell)
}

/// Resolve a handshake command spec into the argv to exec.
pub fn resolve_command(spec: &CommandSpec, shell_override: Option<&str>) -> Vec<String> {
    match spec {
        CommandSpec::ShellLine(line) => vec![line_shell(), "-lc".to_string(), line.clone()],
        CommandSpec::Exec(argv) => argv.clone(),
        CommandSpec::Interactive => vec![login_shell(shell_override), "-l".to_string()],
    }
}
