//! Handshake payload and command spec.
//!
//! The first frame on every connection carries a JSON object negotiating
//! authentication and the initial session parameters.

use serde::{Deserialize, Serialize};

/// Window rows assumed when the client does not send a size.
pub const DEFAULT_ROWS: u32 = 24;
/// Window columns assumed when the client does not send a size.
pub const DEFAULT_COLS: u32 = 80;

/// The JSON payload of a `Handshake` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Shared-secret token; must match the server's configured secret when
    /// one is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,

    /// What to run in the session; absent means a login shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<CmdField>,
}

/// The `cmd` field accepts either a shell command line or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmdField {
    Line(String),
    Argv(Vec<String>),
}

/// What to run in the session, decided exactly once at handshake parse
/// time and never re-interpreted later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// No command requested: exec the login shell with `-l`.
    Interactive,
    /// A single command line, run through `shell -lc <line>`.
    ShellLine(String),
    /// An argv vector, exec'd verbatim.
    Exec(Vec<String>),
}

impl HandshakeRequest {
    /// Parse a handshake payload.
    ///
    /// Any failure (bad JSON, non-UTF-8 bytes, wrong shape) maps to the
    /// single on-wire "invalid handshake json" error at the call site.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn rows(&self) -> u32 {
        self.rows.unwrap_or(DEFAULT_ROWS)
    }

    pub fn cols(&self) -> u32 {
        self.cols.unwrap_or(DEFAULT_COLS)
    }

    /// Fold the dynamic `cmd` field into a [`CommandSpec`].
    ///
    /// An empty string or empty list means "no command", same as absent.
    pub fn command_spec(&self) -> CommandSpec {
        match &self.cmd {
            Some(CmdField::Line(line)) if !line.is_empty() => CommandSpec::ShellLine(line.clone()),
            Some(CmdField::Argv(argv)) if !argv.is_empty() => CommandSpec::Exec(argv.clone()),
            _ => CommandSpec::Interactive,
        }
    }
}
