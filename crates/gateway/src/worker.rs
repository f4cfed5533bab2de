//! Decode worker processes
//!
//! Every prompt runs in its own subordinate process whose stdout is the
//! generated text. The gateway reads it in chunks, re-cut on UTF-8
//! boundaries, and kills the process when the client goes away.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Replaced by the connected peer's address in launcher arguments
pub const PEER_PLACEHOLDER: &str = "{peer}";

const READ_CHUNK: usize = 4096;

/// Starts one decode worker per prompt
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, prompt: &str, peer: &str) -> Result<WorkerHandle>;
}

/// Launches `program args... <prompt>`
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command(&self, prompt: &str, peer: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| a.replace(PEER_PLACEHOLDER, peer)))
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, prompt: &str, peer: &str) -> Result<WorkerHandle> {
        WorkerHandle::spawn(self.command(prompt, peer))
    }
}

/// A running worker: chunked stdout plus a kill switch
pub struct WorkerHandle {
    child: Child,
    stdout: Option<ChildStdout>,
    read_buf: BytesMut,
    chunker: Utf8Chunker,
}

impl WorkerHandle {
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::Worker(std::io::Error::new(
                std::io::ErrorKind::Other,
                "worker stdout not captured",
            ))
        })?;
        info!("🚀 Spawned decode worker (pid {:?})", child.id());

        Ok(Self {
            child,
            stdout: Some(stdout),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            chunker: Utf8Chunker::default(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next piece of output text, `None` once stdout is closed. Never splits
    /// a multi-byte character; safe to cancel.
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        loop {
            let stdout = match self.stdout.as_mut() {
                Some(stdout) => stdout,
                None => return Ok(None),
            };

            self.read_buf.clear();
            let n = stdout.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                self.stdout = None;
                let rest = self.chunker.finish();
                return Ok((!rest.is_empty()).then_some(rest));
            }

            let text = self.chunker.push(&self.read_buf);
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }

    /// Wait for the worker to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        debug!("Decode worker exited with {}", status);
        Ok(status)
    }

    /// Kill the worker and reap it
    pub async fn kill(&mut self) {
        match self.child.kill().await {
            Ok(()) => info!("🛑 Killed decode worker"),
            Err(e) => warn!("⚠️ Failed to kill decode worker: {}", e),
        }
    }
}

/// Re-cuts a byte stream into valid UTF-8 text. Incomplete trailing
/// sequences are held back until the next push; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix decodes
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_holds_split_character() {
        let bytes = "né!".as_bytes();
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&bytes[..2]), "n");
        assert_eq!(chunker.push(&bytes[2..]), "é!");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(chunker.push(&[0xe2, 0x82]), "");
        assert_eq!(chunker.finish(), "\u{fffd}");
    }

    #[test]
    fn test_peer_placeholder() {
        let launcher = CommandLauncher::new("duoshard").with_args(["prompt", "--server", "{peer}:5555"]);
        let cmd = launcher.command("hello", "10.0.0.2");
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["prompt", "--server", "10.0.0.2:5555", "hello"]);
    }

    #[tokio::test]
    async fn test_worker_output_and_status() {
        let launcher = CommandLauncher::new("printf").with_args(["%s-%s", "{peer}"]);
        let mut worker = launcher.launch("ok", "p").unwrap();

        let mut out = String::new();
        while let Some(chunk) = worker.next_chunk().await.unwrap() {
            out.push_str(&chunk);
        }
        assert_eq!(out, "p-ok");
        assert!(worker.wait().await.unwrap().success());
    }
}
