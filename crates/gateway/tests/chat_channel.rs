use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use duoshard_gateway::{
    ChatChannel, ChatSession, CommandLauncher, GatewayError, NodeContext, Result, WorkerHandle,
    WorkerLauncher, DONE_SENTINEL,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// In-memory chat transport; the test keeps the other ends
struct MemoryChannel {
    inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ChatChannel for MemoryChannel {
    async fn recv(&mut self) -> Option<String> {
        self.inbox.recv().await
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outbox.send(text).map_err(|_| GatewayError::ClientDisconnected)
    }
}

struct Client {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Client {
    fn prompt(&self, prompt: &str) {
        self.tx.send(serde_json::json!({ "prompt": prompt }).to_string()).unwrap();
    }

    async fn frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(10), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    /// Text frames up to and including the sentinel
    async fn until_done(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        loop {
            let frame = self.frame().await;
            let done = frame == DONE_SENTINEL;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

fn error_code(frame: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    (value["type"] == "error").then(|| value["code"].as_str().unwrap_or_default().to_string())
}

/// Counts launches, records worker pids and delegates to a real command
struct CountingLauncher {
    inner: CommandLauncher,
    launches: AtomicUsize,
    pids: Mutex<Vec<u32>>,
}

impl CountingLauncher {
    fn new(inner: CommandLauncher) -> Arc<Self> {
        Arc::new(Self {
            inner,
            launches: AtomicUsize::new(0),
            pids: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn pids(&self) -> Vec<u32> {
        self.pids.lock().clone()
    }
}

impl WorkerLauncher for CountingLauncher {
    fn launch(&self, prompt: &str, peer: &str) -> Result<WorkerHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let worker = self.inner.launch(prompt, peer)?;
        self.pids.lock().extend(worker.id());
        Ok(worker)
    }
}

fn echo_launcher() -> Arc<CountingLauncher> {
    CountingLauncher::new(CommandLauncher::new("printf").with_args(["%s|%s", "{peer}"]))
}

fn shell_launcher(script: &str) -> Arc<CountingLauncher> {
    CountingLauncher::new(CommandLauncher::new("sh").with_args(["-c", script, "sh"]))
}

fn ready_context() -> Arc<NodeContext> {
    let ctx = Arc::new(NodeContext::with_node_id("testnode", Vec::new()));
    ctx.go_online();
    ctx.connect("peer");
    ctx
}

fn open(
    ctx: Arc<NodeContext>,
    launcher: Arc<CountingLauncher>,
    delay: Duration,
) -> (Client, tokio::task::JoinHandle<()>) {
    let (client_tx, inbox) = mpsc::unbounded_channel();
    let (outbox, client_rx) = mpsc::unbounded_channel();
    let session = ChatSession::new(ctx, launcher).with_no_compute_delay(delay);
    let task = tokio::spawn(async move { session.run(MemoryChannel { inbox, outbox }).await });
    (Client { tx: client_tx, rx: client_rx }, task)
}

#[tokio::test]
async fn test_empty_prompt_keeps_channel_open() {
    let launcher = echo_launcher();
    let (mut client, task) = open(ready_context(), Arc::clone(&launcher), Duration::ZERO);

    client.prompt("");
    assert_eq!(error_code(&client.frame().await).as_deref(), Some("no_prompt"));

    client.tx.send("garbage".to_string()).unwrap();
    assert_eq!(error_code(&client.frame().await).as_deref(), Some("no_prompt"));
    assert_eq!(launcher.count(), 0);

    client.prompt("hello");
    let frames = client.until_done().await;
    assert_eq!(frames.last().map(String::as_str), Some(DONE_SENTINEL));
    assert_eq!(frames[..frames.len() - 1].concat(), "peer|hello");
    assert_eq!(launcher.count(), 1);

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn test_offline_replies_no_compute_once() {
    let ctx = Arc::new(NodeContext::with_node_id("offline", Vec::new()));
    ctx.connect("peer");
    let launcher = echo_launcher();
    let delay = Duration::from_millis(100);
    let (mut client, task) = open(ctx, Arc::clone(&launcher), delay);

    let start = Instant::now();
    client.prompt("hello");
    let frame = client.frame().await;
    assert!(start.elapsed() >= delay);
    assert_eq!(error_code(&frame).as_deref(), Some("no_compute"));

    // Nothing else follows and nothing was spawned
    drop(client.tx);
    task.await.unwrap();
    assert!(client.rx.recv().await.is_none());
    assert_eq!(launcher.count(), 0);
}

#[tokio::test]
async fn test_not_connected_is_no_compute() {
    let ctx = Arc::new(NodeContext::with_node_id("lonely", Vec::new()));
    ctx.go_online();
    let launcher = echo_launcher();
    let (mut client, _task) = open(ctx, Arc::clone(&launcher), Duration::ZERO);

    client.prompt("hello");
    assert_eq!(error_code(&client.frame().await).as_deref(), Some("no_compute"));
    assert_eq!(launcher.count(), 0);
}

#[tokio::test]
async fn test_multibyte_output_forwarded_in_order() {
    let (mut client, _task) = open(ready_context(), echo_launcher(), Duration::ZERO);

    let prompt = "héllo wörld ✓ 日本";
    client.prompt(prompt);
    let frames = client.until_done().await;
    assert_eq!(frames[..frames.len() - 1].concat(), format!("peer|{}", prompt));
}

#[tokio::test]
async fn test_prompts_processed_in_arrival_order() {
    let (mut client, _task) = open(ready_context(), echo_launcher(), Duration::ZERO);

    client.prompt("one");
    client.prompt("two");
    let first = client.until_done().await;
    let second = client.until_done().await;
    assert_eq!(first[..first.len() - 1].concat(), "peer|one");
    assert_eq!(second[..second.len() - 1].concat(), "peer|two");
}

#[tokio::test]
async fn test_failing_worker_reports_before_done() {
    let (mut client, _task) = open(ready_context(), shell_launcher("printf partial; exit 3"), Duration::ZERO);

    client.prompt("hello");
    let frames = client.until_done().await;
    assert_eq!(frames.len(), 3, "{:?}", frames);
    assert_eq!(frames[0], "partial");
    assert_eq!(error_code(&frames[1]).as_deref(), Some("worker_failed"));
    assert_eq!(frames[2], DONE_SENTINEL);
}

#[tokio::test]
async fn test_disconnect_kills_worker() {
    let launcher = shell_launcher("printf started; exec sleep 30");
    let (mut client, task) = open(ready_context(), Arc::clone(&launcher), Duration::ZERO);

    client.prompt("hello");
    assert_eq!(client.frame().await, "started");
    let pids = launcher.pids();
    assert_eq!(pids.len(), 1);
    assert!(process_exists(pids[0]));

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not stop after disconnect")
        .unwrap();

    // Killed and reaped by the session, not left for a later drop
    assert!(!process_exists(pids[0]), "worker {} still running", pids[0]);
}

fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
