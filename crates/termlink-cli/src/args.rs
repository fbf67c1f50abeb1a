//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

/// Remote shell over a framed binary TCP protocol.
///
/// `termlink serve` attaches a pseudo-terminal to a spawned shell or
/// command per connection; `termlink connect` puts the local terminal in
/// raw mode and bridges it to a remote session.
#[derive(Debug, Parser)]
#[command(name = "termlink", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon: accept connections and serve PTY sessions
    #[command(after_help = "\
Examples:
  termlink serve                        # Listen on 0.0.0.0:7070
  termlink serve -p 2222                # Custom port
  termlink serve --token s3cret         # Require a shared secret
  termlink serve --shell /usr/bin/zsh   # Shell for interactive sessions

Environment:
  TERMLINK_HOST, TERMLINK_PORT, TERMLINK_TOKEN, TERMLINK_SHELL")]
    Serve(ServeArgs),

    /// Connect the local terminal to a remote session
    #[command(after_help = "\
Examples:
  termlink connect                      # Login shell on 127.0.0.1:7070
  termlink connect --host box -p 2222   # Remote daemon
  termlink connect --token s3cret       # Authenticate
  termlink connect -- htop              # Run a command instead of a shell
  termlink connect -- ls -la /tmp       # Arguments pass through verbatim")]
    Connect(ConnectArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    /// Address to listen on [env: TERMLINK_HOST] [default: 0.0.0.0]
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on [env: TERMLINK_PORT] [default: 7070]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Shared-secret token clients must present [env: TERMLINK_TOKEN]
    #[arg(long)]
    pub token: Option<String>,

    /// Shell for interactive sessions [env: TERMLINK_SHELL]
    #[arg(long)]
    pub shell: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ConnectArgs {
    /// Server address [env: TERMLINK_HOST] [default: 127.0.0.1]
    #[arg(long)]
    pub host: Option<String>,

    /// Server port [env: TERMLINK_PORT] [default: 7070]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Shared-secret token [env: TERMLINK_TOKEN]
    #[arg(long)]
    pub token: Option<String>,

    /// Command to exec remotely instead of a login shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}
