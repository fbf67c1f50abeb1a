//! PTY session management using portable-pty.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use termlink_core::error::SessionError;

/// Terminal size in rows and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl TermSize {
    /// Build from the u32 dimensions carried on the wire.
    pub fn from_wire(rows: u32, cols: u32) -> Self {
        Self {
            rows: u16::try_from(rows).unwrap_or(u16::MAX),
            cols: u16::try_from(cols).unwrap_or(u16::MAX),
        }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A PTY pair with a child process attached to the slave side.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    size: TermSize,
}

impl PtySession {
    /// Spawn an argv in a fresh PTY at the given window size.
    ///
    /// The child inherits the daemon's environment, with
    /// `TERM=xterm-256color` filled in when the daemon itself has no TERM.
    pub fn spawn(argv: &[String], size: TermSize) -> Result<Self, SessionError> {
        if argv.is_empty() {
            return Err(SessionError::Spawn {
                command: String::new(),
                reason: "command cannot be empty".to_string(),
            });
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| SessionError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        if argv.len() > 1 {
            cmd.args(&argv[1..]);
        }
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| SessionError::Spawn {
            command: argv.join(" "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            master: pair.master,
            child,
            size,
        })
    }

    /// Get a reader for the PTY output.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>, SessionError> {
        self.master
            .try_clone_reader()
            .map_err(|e| SessionError::OpenPty(e.to_string()))
    }

    /// Get a writer for the PTY input.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>, SessionError> {
        self.master
            .take_writer()
            .map_err(|e| SessionError::OpenPty(e.to_string()))
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    fn into_parts(self) -> (Box<dyn MasterPty + Send>, Box<dyn Child + Send + Sync>) {
        (self.master, self.child)
    }
}

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Async handle over a spawned session.
///
/// The blocking PTY reads and writes run on background threads bridged to
/// the async world with tokio channels. Exactly one connection handler
/// owns a handle; nothing else touches the master descriptor.
pub struct PtyHandle {
    /// Sender for bytes bound for the child's stdin.
    write_tx: mpsc::Sender<Vec<u8>>,
    /// Receiver for child output.
    ///
    /// Wrapped in a tokio Mutex so `read()` can take `&self`; the handler
    /// is the only reader in practice.
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Master PTY, dropped (closed) exactly once on teardown.
    master: std::sync::Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Child process handle, signalled on teardown.
    child: std::sync::Mutex<Box<dyn Child + Send + Sync>>,
    /// Current window size, updated on resize.
    size: std::sync::Mutex<TermSize>,
    /// Set by the first teardown; later calls are no-ops.
    closed: AtomicBool,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl PtyHandle {
    /// Wrap a spawned session in async I/O channels.
    pub fn new(session: PtySession) -> Result<Self, SessionError> {
        let reader = session.reader()?;
        let writer = session.writer()?;
        let initial_size = session.size();
        let (master, child) = session.into_parts();

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        let reader_thread = std::thread::spawn(move || {
            Self::reader_loop(reader, read_tx);
        });
        let writer_thread = std::thread::spawn(move || {
            Self::writer_loop(writer, write_rx);
        });

        Ok(Self {
            write_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            master: std::sync::Mutex::new(Some(master)),
            child: std::sync::Mutex::new(child),
            size: std::sync::Mutex::new(initial_size),
            closed: AtomicBool::new(false),
            reader_thread: Some(reader_thread),
            writer_thread: Some(writer_thread),
        })
    }

    /// Send bytes to the child's stdin.
    ///
    /// Fails once the session is torn down or the writer thread has exited
    /// (child already gone).
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.write_tx
            .send(data.to_vec())
            .await
            .map_err(|_| SessionError::Write("input channel closed".to_string()))
    }

    /// Receive the next chunk of child output.
    ///
    /// Returns `None` on PTY EOF or after teardown.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Resize the PTY (delivers SIGWINCH to the child) and update the
    /// stored dimensions.
    pub fn resize(&self, size: TermSize) -> Result<(), SessionError> {
        let master = self.master.lock().map_err(|_| SessionError::Closed)?;
        let master = master.as_ref().ok_or(SessionError::Closed)?;
        master
            .resize(size.into())
            .map_err(|e| SessionError::Resize(e.to_string()))?;
        *self.size.lock().map_err(|_| SessionError::Closed)? = size;
        Ok(())
    }

    /// Current window size as last applied.
    pub fn size(&self) -> TermSize {
        self.size.lock().map(|size| *size).unwrap_or_default()
    }

    /// Tear down the session: close the master, hang up the child.
    ///
    /// Idempotent; the second and later calls do nothing, so a PTY EOF
    /// racing a client exit still closes the descriptor exactly once.
    /// Never fails: each release step is attempted independently and
    /// failures are logged, since teardown runs during shutdown where
    /// there is no longer anyone to hand an error to.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the master closes the descriptor, which unblocks the
        // reader thread with EOF.
        match self.master.lock() {
            Ok(mut master) => {
                master.take();
            }
            Err(_) => warn!("master PTY mutex poisoned during teardown"),
        }

        if let Ok(mut child) = self.child.lock() {
            if let Some(pid) = child.process_id() {
                // SAFETY: SIGHUP to a child we spawned; if it already
                // exited the call fails harmlessly with ESRCH.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
                if rc != 0 {
                    debug!(
                        "failed to hang up child {}: {}",
                        pid,
                        std::io::Error::last_os_error()
                    );
                }
            }
            // Collect the exit status if it is already available; never
            // block waiting for the child to die.
            if let Err(e) = child.try_wait() {
                debug!("failed to collect child exit status: {}", e);
            }
        }
    }

    /// Reader loop running on a background thread.
    fn reader_loop(mut reader: Box<dyn Read + Send>, read_tx: mpsc::Sender<Vec<u8>>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!("PTY read channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => {
                    // EIO is the normal end of a Linux PTY whose child left.
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Writer loop running on a background thread.
    fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                error!("PTY write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush() {
                error!("PTY flush error: {}", e);
                break;
            }
        }
        debug!("PTY writer exiting");
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.teardown();

        // The threads exit on their own: the reader sees EOF once the
        // master is closed, the writer stops when write_tx drops with us.
        // Joining here could block on a reader stuck in read(), so don't.
        if let Some(ref handle) = self.reader_thread {
            if !handle.is_finished() {
                debug!("PTY reader thread still running on drop, will exit on PTY close");
            }
        }
        if let Some(ref handle) = self.writer_thread {
            if !handle.is_finished() {
                debug!("PTY writer thread still running on drop, will exit on channel close");
            }
        }
    }
}
