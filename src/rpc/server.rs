//! Unix socket RPC server.

use super::dispatch::dispatch;
use super::frame::{FrameKind, read_frame};
use super::protocol::{Request, Response};
use super::session::Session;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::observability::{SessionGauge, record_rpc_request, span_session};
use std::collections::HashMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

struct SessionEntry {
    session: Arc<Session>,
    worker: Option<JoinHandle<()>>,
}

struct ServerShared {
    ctx: Arc<Context>,
    config: ServerConfig,
    running: AtomicBool,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_session: AtomicU64,
}

/// Serves a [`Context`] on a Unix socket.
pub struct RpcServer;

impl RpcServer {
    /// Bind the socket and start accepting connections.
    ///
    /// A stale socket file at the configured path is removed first.
    pub fn spawn(ctx: Arc<Context>, config: ServerConfig) -> Result<ServerHandle> {
        let path = config.socket_path.clone();
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), max_sessions = config.max_sessions, "RPC server listening");

        let shared = Arc::new(ServerShared {
            ctx,
            config,
            running: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        });
        let accept_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name("mediaplane-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        Ok(ServerHandle {
            shared,
            path,
            acceptor: Some(acceptor),
        })
    }
}

/// A running server. Dropping it shuts the server down.
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    path: PathBuf,
    acceptor: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Socket path the server listens on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Live output subscriptions across every connected session.
    pub fn output_subscriptions(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.session.output_subscriptions())
            .sum()
    }

    /// Stop accepting, disconnect every session and remove the socket file.
    ///
    /// Subscriptions and buffers held by the disconnected clients are
    /// released. The context itself is left running.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        if let Some(acceptor) = self.acceptor.take()
            && acceptor.join().is_err()
        {
            error!("accept thread panicked");
        }

        let entries: Vec<SessionEntry> = self
            .shared
            .sessions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.session.close();
        }
        for mut entry in entries {
            if let Some(worker) = entry.worker.take()
                && worker.join().is_err()
            {
                error!(session = entry.session.id(), "session worker panicked");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "socket file already gone");
        }
        info!("RPC server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("path", &self.path)
            .field("sessions", &self.session_count())
            .finish()
    }
}

fn accept_loop(listener: UnixListener, shared: Arc<ServerShared>) {
    for stream in listener.incoming() {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = admit(&shared, stream) {
            warn!(error = %e, "connection refused");
        }
    }
    trace!("accept loop finished");
}

fn admit(shared: &Arc<ServerShared>, stream: UnixStream) -> Result<()> {
    let mut sessions = shared.sessions.lock().unwrap();
    // Reap sessions whose workers already finished.
    sessions.retain(|_, entry| entry.worker.as_ref().is_some_and(|w| !w.is_finished()));
    if sessions.len() >= shared.config.max_sessions {
        return Err(Error::ResourceExhausted(format!(
            "{} sessions connected",
            sessions.len()
        )));
    }

    stream.set_write_timeout(Some(shared.config.write_timeout))?;
    let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    let session = Arc::new(Session::new(id, stream));
    let worker_shared = Arc::clone(shared);
    let worker_session = Arc::clone(&session);
    let worker = thread::Builder::new()
        .name(format!("mediaplane-session-{}", id))
        .spawn(move || serve(worker_shared, worker_session))?;
    sessions.insert(
        id,
        SessionEntry {
            session,
            worker: Some(worker),
        },
    );
    Ok(())
}

/// Tears a session down when its worker exits, unwinding included.
struct SessionTeardown<'a> {
    shared: &'a ServerShared,
    session: &'a Session,
}

impl Drop for SessionTeardown<'_> {
    fn drop(&mut self) {
        self.session.close();
        self.session.cleanup(&self.shared.ctx);
        self.shared.sessions.lock().unwrap().remove(&self.session.id());
        debug!("session ended");
    }
}

fn serve(shared: Arc<ServerShared>, session: Arc<Session>) {
    let span = span_session(session.id());
    let _enter = span.enter();
    let _gauge = SessionGauge::enter();
    let _teardown = SessionTeardown {
        shared: &shared,
        session: &session,
    };
    debug!("session started");

    loop {
        let frame = match read_frame(session.stream()) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_disconnect() || session.is_closed() => break,
            Err(e) => {
                warn!(error = %e, "bad frame, dropping session");
                break;
            }
        };

        let kind = frame.header.kind;
        if !matches!(kind, FrameKind::Request | FrameKind::Notice) {
            warn!(?kind, "unexpected frame kind from client");
            break;
        }
        let request = match Request::decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable request, dropping session");
                break;
            }
        };

        let op = request.opcode();
        record_rpc_request(op.name());
        trace!(%op, seq = frame.header.seq, "request");
        let reply = dispatch(&shared.ctx, &session, request, frame.fds);

        if kind == FrameKind::Notice {
            if let Response::Error { message, .. } = &reply.response {
                debug!(%op, error = %message, "notice failed");
            }
            continue;
        }
        let sent = reply.response.encode().and_then(|bytes| {
            let fd = reply.segment.as_ref().map(|segment| segment.fd());
            session.send(FrameKind::Response, frame.header.seq, &bytes, fd)
        });
        if let Err(e) = sent {
            debug!(error = %e, "response not delivered");
            break;
        }
    }
}
