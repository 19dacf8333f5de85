//! A running shell plus at most one attached client.
//!
//! Three background tasks serve a session: a blocking PTY reader, an exit
//! watcher, and per attached client a forwarder that drains the client's
//! outbound queue onto its transport.

use super::pty::{PtyProcess, PtyReader};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webshell_core::protocol::SESSION_ENDED;
use webshell_core::{OutboundTransport, WebshellResult};

/// Capacity of a client's outbound queue, in chunks.
pub const OUTBOUND_CAPACITY: usize = 256;

const READ_BUF_SIZE: usize = 8192;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Lets the reader drain the last output before an exit closes the session.
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// What happened to one chunk of PTY output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The client's queue was full.
    Dropped,
    NoClient,
}

struct Client {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Returned by [`Session::attach`]; identifies the attachment and exposes its
/// cancellation.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when this client is detached or the session ends.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Snapshot used for listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub pid: u32,
    pub idle_secs: u64,
    pub attached: bool,
    pub recording: Option<PathBuf>,
    pub recorded_bytes: u64,
}

pub struct Session {
    id: String,
    process: Arc<PtyProcess>,
    client: Mutex<Option<Client>>,
    next_client: AtomicU64,
    /// Unix millis of the last I/O or attach.
    last_active: AtomicU64,
    done: CancellationToken,
    /// Cancelled once the process is reaped and the recording saved.
    finished: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Wrap a spawned process and start its reader and exit watcher.
    /// Must be called inside a tokio runtime.
    pub fn new(id: impl Into<String>, process: PtyProcess) -> WebshellResult<Arc<Self>> {
        let reader = process.take_reader()?;
        let session = Arc::new(Self {
            id: id.into(),
            process: Arc::new(process),
            client: Mutex::new(None),
            next_client: AtomicU64::new(1),
            last_active: AtomicU64::new(now_millis()),
            done: CancellationToken::new(),
            finished: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        tokio::task::spawn_blocking(move || read_loop(weak, reader));
        tokio::spawn(watch_exit(Arc::downgrade(&session)));

        debug!(session_id = %session.id, pid = session.process.pid(), "session started");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Cancelled exactly once, when the session closes.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let millis = now_millis().saturating_sub(by.as_millis() as u64);
        self.last_active.store(millis, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_active.load(Ordering::Acquire);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    pub fn is_attached(&self) -> bool {
        self.client.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid(),
            idle_secs: self.idle_for().as_secs(),
            attached: self.is_attached(),
            recording: self.process.recorder().path().map(|p| p.to_path_buf()),
            recorded_bytes: self.process.recorder().bytes_recorded(),
        }
    }

    /// Make `transport` the session's only client. Any previous client is
    /// detached first. The client's token is a child of `parent`.
    pub fn attach<T: OutboundTransport>(&self, parent: &CancellationToken, transport: T) -> ClientHandle {
        self.detach();

        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(Client {
                id,
                tx,
                cancel: cancel.clone(),
            });
        }

        tokio::spawn(forward(rx, transport, cancel.clone(), self.done.clone()));

        let (done, watched) = (self.done.clone(), cancel.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
        });

        self.touch();
        info!(session_id = %self.id, client = id, "client attached");
        ClientHandle { id, cancel }
    }

    /// Detach whatever client is attached. No-op without one.
    pub fn detach(&self) {
        let previous = self.client.lock().ok().and_then(|mut c| c.take());
        if let Some(client) = previous {
            info!(session_id = %self.id, client = client.id, "client detached");
            client.cancel.cancel();
            drop(client.tx);
        }
        self.touch();
    }

    /// Detach `handle` only if it is still the attached client.
    pub fn release(&self, handle: &ClientHandle) -> bool {
        let previous = match self.client.lock() {
            Ok(mut slot) if slot.as_ref().is_some_and(|c| c.id == handle.id) => slot.take(),
            _ => None,
        };
        handle.cancel.cancel();
        match previous {
            Some(client) => {
                info!(session_id = %self.id, client = client.id, "client released");
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Send one chunk of output to the attached client without blocking.
    pub fn deliver(&self, chunk: Vec<u8>) -> Delivery {
        let Ok(slot) = self.client.lock() else {
            return Delivery::NoClient;
        };
        let Some(client) = slot.as_ref() else {
            return Delivery::NoClient;
        };
        match client.tx.try_send(chunk) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                trace!(session_id = %self.id, bytes = chunk.len(), "client queue full, dropping output");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoClient,
        }
    }

    /// Write client input to the shell.
    pub fn write_to_tty(&self, data: &[u8]) -> io::Result<usize> {
        self.touch();
        self.process.write(data)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        self.process.resize(rows, cols)
    }

    /// End the session. Only the first call has any effect. Reaping the
    /// shell and saving the recording block, so inside a runtime they run on
    /// the blocking pool; [`Session::wait_closed`] resolves once they finish.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.id, pid = self.process.pid(), "closing session");
        self.done.cancel();

        let (process, finished) = (self.process.clone(), self.finished.clone());
        let teardown = move || {
            process.kill();
            finished.cancel();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => drop(rt.spawn_blocking(teardown)),
            Err(_) => teardown(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait until a closed session's process is gone and its recording saved.
    pub async fn wait_closed(&self) {
        self.finished.cancelled().await
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn read_loop(session: Weak<Session>, mut reader: PtyReader) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the slave side is gone.
                debug!(error = %e, "PTY read ended");
                break;
            }
        };
        let Some(session) = session.upgrade() else { return };
        session.deliver(buf[..n].to_vec());
        session.touch();
    }
    if let Some(session) = session.upgrade() {
        session.close();
    }
}

async fn watch_exit(session: Weak<Session>) {
    loop {
        let Some(s) = session.upgrade() else { return };
        if s.is_closed() {
            return;
        }
        let exited = s.process.try_wait();
        match exited {
            Ok(Some(status)) => {
                debug!(session_id = %s.id, %status, "shell exited");
                let done = s.done.clone();
                drop(s);
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tokio::time::sleep(EXIT_GRACE) => {
                        if let Some(s) = session.upgrade() {
                            s.close();
                        }
                    }
                }
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(session_id = %s.id, error = %e, "exit check failed"),
        }
        let done = s.done.clone();
        drop(s);
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
        }
    }
}

/// Drain a client's queue onto its transport until the client is cancelled,
/// the queue closes or a send fails. When the session itself ended, queued
/// output is flushed and the end-of-session status sent before closing.
async fn forward<T: OutboundTransport>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut transport: T,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let mut healthy = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(data) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = transport.send_data(data) => sent,
                    };
                    if let Err(e) = sent {
                        debug!(error = %e, "client send failed");
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if healthy && done.is_cancelled() {
        while let Ok(data) = rx.try_recv() {
            if transport.send_data(data).await.is_err() {
                break;
            }
        }
        if let Err(e) = transport.send_status(SESSION_ENDED).await {
            debug!(error = %e, "failed to send session status");
        }
    }

    cancel.cancel();
    if let Err(e) = transport.close().await {
        debug!(error = %e, "transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::SpawnOptions;
    use crate::session::testing::{ChannelTransport, Event, StalledTransport};
    use std::time::Instant;

    fn spawn(program: &str, args: &[&str]) -> Arc<Session> {
        let mut options = SpawnOptions::new(program);
        options.args = args.iter().map(|a| a.to_string()).collect();
        options.env = vec!["PATH=/usr/bin:/bin".into()];
        Session::new("test", PtyProcess::spawn(options).unwrap()).unwrap()
    }

    async fn wait_for_data(rx: &mut mpsc::UnboundedReceiver<Event>, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        while !seen.contains(needle) {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Event::Data(d)) => seen.push_str(&String::from_utf8_lossy(&d)),
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }
        seen
    }

    async fn next_non_data(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(Event::Data(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn input_echoes_to_attached_client() {
        let session = spawn("/bin/cat", &[]);
        let (transport, mut rx) = ChannelTransport::new();
        let handle = session.attach(&CancellationToken::new(), transport);
        assert!(session.is_attached());

        session.write_to_tty(b"hello-session\n").unwrap();
        assert!(wait_for_data(&mut rx, "hello-session").await.contains("hello-session"));

        assert!(session.release(&handle));
        assert!(!session.is_attached());
        session.close();
    }

    #[tokio::test]
    async fn shell_exit_ends_session() {
        let session = spawn("/bin/sh", &["-c", "echo bye; exit 0"]);
        let (transport, mut rx) = ChannelTransport::new();
        let handle = session.attach(&CancellationToken::new(), transport);

        assert!(matches!(
            next_non_data(&mut rx).await,
            Some(Event::Status(s)) if s == SESSION_ENDED
        ));
        assert!(matches!(next_non_data(&mut rx).await, Some(Event::Closed)));
        assert!(session.is_closed());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn new_attach_replaces_old_client() {
        let session = spawn("/bin/cat", &[]);
        let (first, mut first_rx) = ChannelTransport::new();
        let (second, mut second_rx) = ChannelTransport::new();

        let a = session.attach(&CancellationToken::new(), first);
        let b = session.attach(&CancellationToken::new(), second);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        // The replaced client is closed without an end-of-session status.
        assert!(matches!(next_non_data(&mut first_rx).await, Some(Event::Closed)));

        session.write_to_tty(b"second\n").unwrap();
        assert!(wait_for_data(&mut second_rx, "second").await.contains("second"));

        // A stale release must not evict the current client.
        assert!(!session.release(&a));
        assert!(session.is_attached());
        session.close();
    }

    #[tokio::test]
    async fn detach_without_client_is_noop() {
        let session = spawn("/bin/cat", &[]);
        session.detach();
        session.detach();
        assert!(!session.is_attached());
        assert_eq!(session.deliver(b"x".to_vec()), Delivery::NoClient);
        session.close();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let session = spawn("/bin/sh", &["-c", "sleep 30"]);
        let _handle = session.attach(&CancellationToken::new(), StalledTransport);

        let started = Instant::now();
        let outcomes: Vec<Delivery> = (0..OUTBOUND_CAPACITY + 10)
            .map(|_| session.deliver(vec![b'x']))
            .collect();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(outcomes.contains(&Delivery::Dropped));
        assert_eq!(outcomes[0], Delivery::Queued);
        session.close();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = spawn("/bin/sh", &["-c", "sleep 30"]);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let s = session.clone();
                tokio::task::spawn_blocking(move || s.close())
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert!(session.is_closed());
        tokio::time::timeout(Duration::from_secs(5), session.wait_closed())
            .await
            .unwrap();
        assert!(session.process.is_killed());
        assert!(session.write_to_tty(b"x").is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_does_not_block_the_runtime() {
        let session = spawn("/bin/sh", &["-c", "sleep 30"]);
        session.close();
        // Teardown runs on the blocking pool, so the single runtime thread is
        // free to keep polling timers while it completes.
        let ticker = tokio::spawn(tokio::time::sleep(Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(5), session.wait_closed())
            .await
            .unwrap();
        ticker.await.unwrap();
        assert!(session.process.is_killed());
    }

    #[test]
    fn close_outside_runtime_tears_down_inline() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let session = rt.block_on(async { spawn("/bin/sh", &["-c", "sleep 30"]) });
        session.close();
        assert!(session.process.is_killed());
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn attach_updates_activity() {
        let session = spawn("/bin/cat", &[]);
        session.backdate(Duration::from_secs(60));
        assert!(session.idle_for() >= Duration::from_secs(59));

        let (transport, _rx) = ChannelTransport::new();
        session.attach(&CancellationToken::new(), transport);
        assert!(session.idle_for() < Duration::from_secs(5));
        assert!(session.info().attached);
        session.close();
    }
}
