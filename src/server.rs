//! Server core: listen socket, accept loop, connection table, framebuffer
//! lock, and the event queue — the embedder's entry point into the library.

use crate::connection::{self, ConnectionState};
use crate::error::{Result, VncError};
use crate::events::{Event, EventQueue};
use crate::framebuffer::Framebuffer;
use crate::logging::{default_sink, log_error, log_info, LogSink};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Capacity of the server-to-client cut text broadcast channel; a lagging
/// receiver simply misses the oldest backlog entries rather than blocking
/// the embedder's call to [`Server::send_cut_text`].
const CUT_TEXT_CHANNEL_CAPACITY: usize = 16;

/// Overall server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Stopped,
    Working,
    Stop,
}

/// State shared between the server handle, the accept task, and every
/// connection worker.
pub(crate) struct ServerShared {
    pub(crate) fb: Mutex<Framebuffer>,
    updated: AtomicU32,
    pub(crate) events: Mutex<EventQueue>,
    pub(crate) log_sink: LogSink,
    pub(crate) cut_text_tx: broadcast::Sender<String>,
}

impl ServerShared {
    /// Locks the framebuffer. `write = true` (an embedder about to paint)
    /// zeroes the `updated` counter; `write = false` (a worker about to
    /// convert for a client) increments it.
    pub(crate) fn lock_fb(&self, write: bool) -> FbGuard<'_> {
        let guard = self.fb.lock().unwrap();
        if write {
            self.updated.store(0, Ordering::SeqCst);
        } else {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }
        FbGuard { guard }
    }
}

/// RAII guard returned by [`Server::lock_fb`]; releases the lock on drop.
pub struct FbGuard<'a> {
    guard: std::sync::MutexGuard<'a, Framebuffer>,
}

impl Deref for FbGuard<'_> {
    type Target = Framebuffer;
    fn deref(&self) -> &Framebuffer {
        &self.guard
    }
}

impl DerefMut for FbGuard<'_> {
    fn deref_mut(&mut self) -> &mut Framebuffer {
        &mut self.guard
    }
}

struct ConnectionHandle {
    /// Kept for diagnostics (not yet surfaced through a public accessor).
    #[allow(dead_code)]
    addr: SocketAddr,
    state: Arc<Mutex<ConnectionState>>,
    task: JoinHandle<()>,
}

/// A tiny RFB server: owns a framebuffer, accepts clients, and forwards
/// viewer input to a bounded event queue.
pub struct Server {
    shared: Arc<ServerShared>,
    listener: Mutex<Option<TcpListener>>,
    state: Arc<Mutex<ServerState>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    table: Arc<Mutex<HashMap<u64, ConnectionHandle>>>,
}

impl Server {
    /// Allocates a server with a `width`×`height` framebuffer of `bpp` bytes
    /// per pixel (the embedder-facing framebuffer; the wire-level format
    /// offered to clients in `ServerInit` is independently fixed).
    pub fn new(width: u32, height: u32, bpp: u8) -> Result<Self> {
        let fb = Framebuffer::create(width, height, bpp)?;
        let (cut_text_tx, _) = broadcast::channel(CUT_TEXT_CHANNEL_CAPACITY);
        Ok(Server {
            shared: Arc::new(ServerShared {
                fb: Mutex::new(fb),
                updated: AtomicU32::new(0),
                events: Mutex::new(EventQueue::new()),
                log_sink: default_sink(),
                cut_text_tx,
            }),
            listener: Mutex::new(None),
            state: Arc::new(Mutex::new(ServerState::Stopped)),
            accept_task: Mutex::new(None),
            table: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Replaces the default logging sink (which forwards to the `log`
    /// facade) with an embedder-supplied one.
    pub fn set_log_sink(&mut self, sink: impl Fn(&str) + Send + Sync + 'static) {
        // Server is pre-`start`, so this is the only mutable access path;
        // Arc::get_mut would also work but is awkward across the struct's
        // other Arc-held fields, so we rebuild the sink field directly.
        let shared = Arc::get_mut(&mut self.shared)
            .expect("set_log_sink must be called before start()");
        shared.log_sink = Arc::new(sink);
    }

    /// Resolves `host:port` and binds a listening socket (state must be
    /// `Stopped`).
    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    /// Installs a pre-bound, pre-listened socket in place of calling
    /// [`Server::bind`].
    pub fn set_socket(&self, listener: TcpListener) -> Result<()> {
        if *self.state.lock().unwrap() != ServerState::Stopped {
            return Err(VncError::invalid_argument("set_socket requires a stopped server"));
        }
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    /// Spawns the accept loop and blocks until it reports `Working`.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| VncError::invalid_argument("start() called before bind()/set_socket()"))?;

        let shared = self.shared.clone();
        let state = self.state.clone();
        let table = self.table.clone();
        let next_id = AtomicU64::new(0);

        *self.state.lock().unwrap() = ServerState::Working;
        let handle = tokio::spawn(accept_loop(shared, listener, state, table, next_id));
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Requests shutdown and waits for the accept task (and every
    /// connection worker) to finish.
    pub async fn stop(&self) -> Result<()> {
        *self.state.lock().unwrap() = ServerState::Stop;
        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Locks the framebuffer for reading or writing. See [`ServerShared::lock_fb`].
    pub fn lock_fb(&self, write: bool) -> FbGuard<'_> {
        self.shared.lock_fb(write)
    }

    /// Number of times a client has consumed a frame since the last write lock.
    pub fn updated(&self) -> u32 {
        self.shared.updated.load(Ordering::SeqCst)
    }

    /// Pops the oldest queued viewer event, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.shared.events.lock().unwrap().poll_event()
    }

    /// Pushes an event onto the queue (used by tests and embedders that
    /// synthesize their own input).
    pub fn add_event(&self, event: Event) -> Result<()> {
        self.shared.events.lock().unwrap().add_event(event)
    }

    /// Broadcasts clipboard text to every currently connected viewer as a
    /// `ServerCutText` message. A send with no connected clients is not an
    /// error; it simply has no subscribers.
    pub fn send_cut_text(&self, text: impl Into<String>) -> Result<()> {
        let _ = self.shared.cut_text_tx.send(text.into());
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
    table: Arc<Mutex<HashMap<u64, ConnectionHandle>>>,
    next_id: AtomicU64,
) {
    let sink = shared.log_sink.clone();
    log_info!(&sink, "accept loop started on {:?}", listener.local_addr());

    loop {
        if *state.lock().unwrap() != ServerState::Working {
            break;
        }

        match tokio::time::timeout(Duration::from_secs(1), listener.accept()).await {
            Ok(Ok((socket, addr))) => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::new(Mutex::new(ConnectionState::Working));
                let shared2 = shared.clone();
                let conn_state2 = conn_state.clone();
                let task = tokio::spawn(async move {
                    let outcome = connection::run(socket, addr, shared2, conn_state2.clone()).await;
                    let mut s = conn_state2.lock().unwrap();
                    if *s != ConnectionState::Stopped {
                        *s = if outcome.is_ok() { ConnectionState::Stopped } else { ConnectionState::Error };
                    }
                });
                table.lock().unwrap().insert(id, ConnectionHandle { addr, state: conn_state, task });
            }
            Ok(Err(e)) => log_error!(&sink, "accept failed: {e}"),
            Err(_elapsed) => {}
        }

        reap_finished(&table).await;
    }

    shutdown_all(&table).await;
    *state.lock().unwrap() = ServerState::Stopped;
    log_info!(&sink, "accept loop stopped");
}

async fn reap_finished(table: &Arc<Mutex<HashMap<u64, ConnectionHandle>>>) {
    let finished: Vec<u64> = table
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, h)| h.task.is_finished())
        .map(|(id, _)| *id)
        .collect();
    for id in finished {
        let handle = table.lock().unwrap().remove(&id);
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }
    }
}

async fn shutdown_all(table: &Arc<Mutex<HashMap<u64, ConnectionHandle>>>) {
    let ids: Vec<u64> = table.lock().unwrap().keys().copied().collect();
    for id in &ids {
        if let Some(h) = table.lock().unwrap().get(id) {
            *h.state.lock().unwrap() = ConnectionState::Stop;
        }
    }

    loop {
        let all_done = table.lock().unwrap().values().all(|h| h.task.is_finished());
        if all_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let handles: Vec<ConnectionHandle> = table.lock().unwrap().drain().map(|(_, h)| h).collect();
    for h in handles {
        let _ = h.task.await;
    }
}
