//! Terminal bridge: raw local terminal to a framed remote session.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use termlink_core::frame::{read_frame, write_frame, Frame, FrameType, DEFAULT_MAX_PAYLOAD};
use termlink_core::handshake::{CmdField, HandshakeRequest};

use crate::client::terminal::{window_size, RawModeGuard};
use crate::config::ClientConfig;

/// Connect to the daemon and bridge the local terminal to the remote
/// session until either side ends it. Returns the process exit code.
pub async fn run(config: ClientConfig) -> Result<i32> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;
    let (mut reader, mut writer) = stream.into_split();

    // Raw mode before the first byte is forwarded; the guard restores the
    // original mode on every path out of this function, including
    // cancellation by an interrupt signal.
    let _raw = RawModeGuard::enable()?;

    let (rows, cols) = window_size();
    let hello = HandshakeRequest {
        token: config.token.clone(),
        rows: Some(rows),
        cols: Some(cols),
        cmd: config.cmd.clone().map(CmdField::Argv),
    };
    let frame = Frame::handshake(&hello).context("failed to serialize handshake")?;
    write_frame(&mut writer, &frame)
        .await
        .context("failed to send handshake")?;

    // All socket writes funnel through one task so Data frames from the
    // stdin pump and Resize frames from the watcher never interleave
    // mid-frame.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("socket write failed: {}", e);
                break;
            }
        }
        writer
    });

    // stdin pump: raw chunks become Data frames as they arrive.
    let stdin_tx = frame_tx.clone();
    let mut stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(Frame::data(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Resize watcher: independent of both pumps, fires whenever the local
    // terminal changes size while the connection is open.
    let resize_tx = frame_tx.clone();
    let resize_task = tokio::spawn(async move {
        let mut winch = match signal(SignalKind::window_change()) {
            Ok(winch) => winch,
            Err(e) => {
                warn!("failed to register SIGWINCH handler: {}", e);
                return;
            }
        };
        while winch.recv().await.is_some() {
            let (rows, cols) = window_size();
            if resize_tx.send(Frame::resize(rows, cols)).await.is_err() {
                break;
            }
        }
    });

    // Socket pump runs here; first-completed-wins against the stdin pump.
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    loop {
        tokio::select! {
            result = read_frame(&mut reader, DEFAULT_MAX_PAYLOAD) => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("server read ended: {}", e);
                        break;
                    }
                };
                match frame.frame_type() {
                    Some(FrameType::Data) => {
                        if stdout.write_all(&frame.payload).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Some(FrameType::Error) => {
                        // Server-side errors reach the user on stderr; the
                        // terminal is still raw, so move to column zero.
                        let text = String::from_utf8_lossy(&frame.payload);
                        let _ = stderr
                            .write_all(format!("termlink: {}\r\n", text).as_bytes())
                            .await;
                        let _ = stderr.flush().await;
                    }
                    Some(FrameType::Exit) => {
                        debug!("server closed the session");
                        break;
                    }
                    // Unknown frame types are ignored for forward
                    // compatibility.
                    _ => {}
                }
            }
            _ = &mut stdin_task => break,
        }
    }

    // The losing pump and the watcher are cancelled; the final Exit frame
    // is best-effort since the server may already be gone.
    resize_task.abort();
    stdin_task.abort();
    let _ = frame_tx.send(Frame::exit()).await;
    drop(frame_tx);

    if let Ok(mut writer) = writer_task.await {
        let _ = writer.shutdown().await;
    }

    Ok(0)
}
