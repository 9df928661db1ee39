//! Engine subprocess transport over stdin/stdout

use crate::config::EngineConfig;
use crate::error::TransportError;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// File engine stderr is appended to when an error log directory is configured
pub const STDERR_LOG_FILE: &str = "engine-stderr.log";

/// How long to wait for the exit status after stdout reaches EOF
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Write half of the transport.
///
/// Owns the engine process (when there is one) and a single writer task that
/// is the only thing touching stdin. Each `write` hands over one complete
/// message, so concurrent callers can never interleave partial writes.
pub struct Transport {
    /// Channel to the stdin writer task; `None` once shut down
    outgoing_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    child: Option<tokio::sync::Mutex<Child>>,
    released: AtomicBool,
    writer_task: JoinHandle<()>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

/// Read half of the transport, consumed by the connection's read loop
pub struct TransportReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    faults: mpsc::UnboundedReceiver<TransportError>,
}

impl Transport {
    /// Spawn the engine process and create the transport
    pub fn spawn(config: &EngineConfig) -> Result<(Self, TransportReader), TransportError> {
        info!(
            "Spawning engine: {} {:?} (cwd: {:?})",
            config.binary_path.display(),
            config.args,
            config.working_dir
        );

        let mut cmd = Command::new(&config.binary_path);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", config.binary_path.display(), e)))?;

        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingPipe("stderr"))?;

        // Drain stderr so the engine can't deadlock on a full pipe.
        let stderr_task = match config.error_log_dir.as_deref() {
            Some(dir) => tokio::spawn(Self::log_stderr_task(stderr, dir.to_path_buf())),
            None => tokio::spawn(Self::drain_stderr_task(stderr)),
        };

        let (mut transport, reader) = Self::from_streams(stdout, stdin);
        transport.child = Some(tokio::sync::Mutex::new(child));
        *transport.stderr_task.get_mut() = Some(stderr_task);

        debug!("Engine process started");
        Ok((transport, reader))
    }

    /// Build a transport over arbitrary byte streams instead of a child process
    pub fn from_streams<R, W>(reader: R, writer: W) -> (Self, TransportReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(Self::write_task(writer, outgoing_rx, fault_tx));

        (
            Self {
                outgoing_tx: Mutex::new(Some(outgoing_tx)),
                child: None,
                released: AtomicBool::new(false),
                writer_task,
                stderr_task: Mutex::new(None),
            },
            TransportReader {
                stream: Box::new(reader),
                faults: fault_rx,
            },
        )
    }

    /// Queue one complete message for the engine. Never blocks.
    pub fn write(&self, message: Vec<u8>) -> Result<(), TransportError> {
        let outgoing = self.outgoing_tx.lock();
        let tx = outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message)
            .map_err(|_| TransportError::BrokenPipe("writer task has stopped".to_string()))
    }

    /// Whether `shutdown` has run or the writer has stopped
    pub fn is_closed(&self) -> bool {
        self.outgoing_tx
            .lock()
            .as_ref()
            .map(|tx| tx.is_closed())
            .unwrap_or(true)
    }

    /// Exit code of the engine, waiting briefly for it to be reaped
    pub async fn exit_code(&self) -> Option<i32> {
        let child = self.child.as_ref()?;
        let mut child = child.lock().await;
        match tokio::time::timeout(EXIT_STATUS_WAIT, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!("Failed to query engine exit status: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    /// Close stdin, give the engine `grace` to exit, then kill it.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self, grace: Duration) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender lets the writer flush what is queued and close stdin.
        self.outgoing_tx.lock().take();

        if let Some(child) = &self.child {
            let mut child = child.lock().await;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => info!("Engine exited with {}", status),
                Ok(Err(e)) => error!("Failed to wait for engine: {}", e),
                Err(_) => {
                    warn!("Engine did not exit within {:?}, killing it", grace);
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill engine: {}", e);
                    }
                }
            }
        }

        let stderr_task = self.stderr_task.lock().take();
        if let Some(task) = stderr_task {
            if tokio::time::timeout(grace, task).await.is_err() {
                debug!("Stderr drain still running after shutdown");
            }
        }
    }

    /// Background task owning the write half
    async fn write_task<W>(
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        fault_tx: mpsc::UnboundedSender<TransportError>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some(data) = rx.recv().await {
            trace!("Sending to engine: {}", String::from_utf8_lossy(&data).trim_end());
            let written = match writer.write_all(&data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!("Failed to write to engine: {}", e);
                let _ = fault_tx.send(TransportError::BrokenPipe(e.to_string()));
                return;
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Failed to close engine stdin: {}", e);
        }
        debug!("Stdin writer task ended");
    }

    /// Background task forwarding stderr lines to the log
    async fn drain_stderr_task(stderr: ChildStderr) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Engine stderr closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        // Not fatal; engines log diagnostics here.
                        warn!("Engine stderr: {}", trimmed);
                    }
                }
                Err(e) => {
                    error!("Error reading engine stderr: {}", e);
                    break;
                }
            }
        }
    }

    /// Background task appending stderr to `<dir>/engine-stderr.log`
    async fn log_stderr_task(mut stderr: ChildStderr, dir: std::path::PathBuf) {
        let mut file = match open_stderr_log(&dir).await {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "Failed to open stderr log in {}: {}, draining to log instead",
                    dir.display(),
                    e
                );
                return Self::drain_stderr_task(stderr).await;
            }
        };

        match tokio::io::copy(&mut stderr, &mut file).await {
            Ok(n) => debug!("Engine stderr closed ({} bytes logged)", n),
            Err(e) => error!("Error copying engine stderr: {}", e),
        }
        let _ = file.flush().await;
    }
}

async fn open_stderr_log(dir: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(STDERR_LOG_FILE))
        .await
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writer_task.abort();
        if let Some(child) = &self.child {
            if let Ok(mut child) = child.try_lock() {
                if let Err(e) = child.start_kill() {
                    debug!("Engine already gone on drop: {}", e);
                }
            }
        }
    }
}

impl TransportReader {
    /// Read the next chunk of engine output.
    ///
    /// `Ok(0)` means end of stream. Write failures reported by the writer task
    /// surface here as errors so the read loop sees every fatal condition.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        tokio::select! {
            biased;
            Some(fault) = self.faults.recv() => Err(fault),
            read = self.stream.read(buf) => read.map_err(|e| TransportError::Read(e.to_string())),
        }
    }
}
