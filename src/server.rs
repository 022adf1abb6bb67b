//! The reactor: "one acceptor, N workers", each worker an independent
//! `mio::Poll` loop driving a disjoint slice of client connections
//! (SPEC_FULL.md §F). The acceptor thread owns every listening socket
//! named by the config's `ServerConfig::ports` and round-robins accepted
//! streams to workers over an `mpsc` channel; each worker wakes on its own
//! `mio::Waker` to pick them up. Grounded in the teacher's single-reactor
//! `Server`/`HttpConnection` split (`http/http_connection.rs`'s
//! read/parse/write triad), generalized from one thread serving every
//! connection to a fixed pool of them.
//!
//! A session's waiting-list wakeup (`ParkedSession{worker,token}`) may
//! need to resume a session parked on a *different* worker than the one
//! whose fetch just completed — `Shared::workers` gives every worker a
//! handle to every other worker's channel+waker for exactly this case.

use crate::backend::{ConnOrigin, FetchSession, FetchWriteOutcome};
use crate::cache::{Cache, ParkedSession};
use crate::config::{AppConfig, BackendConfig, ServerConfig};
use crate::error::Result;
use crate::expiry::ExpiryEngine;
use crate::http::http_connection::{ActiveAction, Conn, READ_BUF_SIZE};
use crate::http::response;
use crate::policy::{DefaultPolicy, Policy};
use crate::router;
use crate::session::{BackendResponse, Engine, Session, State, StepResult, WaitOutcome};
use crate::stats::Stats;
use crate::storage::Storage;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Collaborators every worker borrows for the duration of a `step`/`run`
/// call, plus every worker's own wakeup handle so cross-worker waiting-list
/// resumes can reach the right reactor.
pub struct Shared {
    pub cache: Cache,
    pub storage: Storage,
    pub expiry: Mutex<ExpiryEngine>,
    pub stats: Stats,
    pub policy: Box<dyn Policy>,
    workers: Vec<WorkerHandle>,
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkerMsg>,
    waker: Arc<Waker>,
}

enum WorkerMsg {
    Accept(TcpStream, Arc<ServerConfig>, SocketAddr),
    WakeParked(usize),
}

/// Top-level server: owns the parsed config and hands off to the acceptor
/// plus worker-thread pool once `run` is called.
pub struct Server {
    configs: Vec<Arc<ServerConfig>>,
    worker_count: usize,
}

impl Server {
    pub fn new(config: AppConfig) -> Result<Self> {
        let configs: Vec<Arc<ServerConfig>> = config.servers.into_iter().map(Arc::new).collect();
        let worker_count = num_cpus::get().max(1);
        Ok(Self {
            configs,
            worker_count,
        })
    }

    /// Spawns the worker pool plus the acceptor thread, then blocks
    /// forever driving the acceptor loop on the calling thread.
    pub fn run(self) -> Result<()> {
        let mut polls = Vec::with_capacity(self.worker_count);
        let mut handles = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (sender, receiver) = mpsc::channel();
            handles.push(WorkerHandle {
                sender,
                waker: Arc::clone(&waker),
            });
            polls.push((poll, receiver));
        }

        let shared = Arc::new(Shared {
            cache: Cache::new(),
            storage: Storage::new(256 * 1024 * 1024),
            expiry: Mutex::new(ExpiryEngine::new()),
            stats: Stats::new(),
            policy: Box::new(DefaultPolicy),
            workers: handles,
        });

        let mut join_handles = Vec::with_capacity(self.worker_count);
        for (id, (poll, receiver)) in polls.into_iter().enumerate() {
            let worker_shared = Arc::clone(&shared);
            join_handles.push(thread::spawn(move || {
                let worker = Worker::new(id, poll, receiver, worker_shared);
                worker.run();
            }));
        }
        proxy_log::info!("spawned {} reactor workers", self.worker_count);

        self.run_acceptor(&shared)?;

        for handle in join_handles {
            let _ = handle.join();
        }
        Ok(())
    }

    fn run_acceptor(&self, shared: &Arc<Shared>) -> Result<()> {
        let poll = Poll::new()?;
        let mut events = Events::with_capacity(64);
        let mut listeners: HashMap<Token, (TcpListener, Arc<ServerConfig>)> = HashMap::new();
        let mut next_token = 1usize;

        for cfg in &self.configs {
            for &port in &cfg.ports {
                let addr: SocketAddr = format!("{}:{}", cfg.host, port).parse()?;
                let mut listener = TcpListener::bind(addr)?;
                let token = Token(next_token);
                next_token += 1;
                poll.registry()
                    .register(&mut listener, token, Interest::READABLE)?;
                proxy_log::info!("listening on {} ({})", addr, cfg.server_name);
                listeners.insert(token, (listener, Arc::clone(cfg)));
            }
        }

        let mut rr = 0usize;
        loop {
            poll.poll(&mut events, None)?;
            for event in events.iter() {
                let Some((listener, cfg)) = listeners.get_mut(&event.token()) else {
                    continue;
                };
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            let worker = rr % self.worker_count;
                            rr = rr.wrapping_add(1);
                            let handle = &shared.workers[worker];
                            if handle
                                .sender
                                .send(WorkerMsg::Accept(stream, Arc::clone(cfg), peer))
                                .is_ok()
                            {
                                let _ = handle.waker.wake();
                            }
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            proxy_log::errors!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// One reactor thread's private state: its own `Poll`, its slice of live
/// connections, the connections currently parked behind a busy objhead,
/// and the backend-socket-token -> client-token map a fetch or pipe needs.
struct Worker {
    id: usize,
    poll: Poll,
    receiver: mpsc::Receiver<WorkerMsg>,
    shared: Arc<Shared>,
    conns: HashMap<Token, Conn>,
    parked: HashMap<Token, Conn>,
    /// Backend-socket token -> client token, for both in-flight fetches
    /// and piped connections.
    peer_tokens: HashMap<Token, Token>,
    /// Client token -> its piped backend token, the reverse direction
    /// `pipe_client_to_backend` needs when a client-readable event fires.
    client_peer: HashMap<Token, Token>,
    next_token: usize,
}

impl Worker {
    fn new(id: usize, poll: Poll, receiver: mpsc::Receiver<WorkerMsg>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            poll,
            receiver,
            shared,
            conns: HashMap::new(),
            parked: HashMap::new(),
            peer_tokens: HashMap::new(),
            client_peer: HashMap::new(),
            next_token: 1,
        }
    }

    fn alloc_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                proxy_log::errors!("worker {} poll failed: {}", self.id, e);
                continue;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    self.drain_messages();
                    continue;
                }
                if let Some(&client_token) = self.peer_tokens.get(&token) {
                    self.handle_peer_event(token, client_token, event);
                    continue;
                }
                self.handle_client_event(token, event);
            }

            self.sweep_timeouts();
        }
    }

    fn drain_messages(&mut self) {
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                WorkerMsg::Accept(stream, cfg, peer) => self.accept(stream, cfg, peer),
                WorkerMsg::WakeParked(token) => self.resume_parked(Token(token)),
            }
        }
    }

    fn accept(&mut self, mut stream: TcpStream, cfg: Arc<ServerConfig>, peer: SocketAddr) {
        let token = self.alloc_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            proxy_log::errors!("worker {} register failed: {}", self.id, e);
            return;
        }
        let workspace_size = cfg.engine.http_req_size + cfg.engine.http_resp_size;
        let session = Session::new(0, workspace_size, Some(peer));
        self.conns.insert(token, Conn::new(stream, cfg, session));
        proxy_log::trace!("worker {} accepted {} as {:?}", self.id, peer, token);
    }

    fn resume_parked(&mut self, token: Token) {
        let Some(mut conn) = self.parked.remove(&token) else {
            return;
        };
        conn.session.state = State::Lookup;
        self.conns.insert(token, conn);
        self.drive(token);
    }

    // ---- client connection events --------------------------------------

    fn handle_client_event(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if matches!(conn.action, ActiveAction::Pipe(_)) {
            if event.is_readable() {
                self.pipe_client_to_backend(token);
            }
            if event.is_writable() {
                self.flush_write(token);
            }
            return;
        }

        if event.is_readable() {
            self.on_client_readable(token);
        }
        if self.conns.contains_key(&token) && event.is_writable() {
            self.flush_write(token);
        }
    }

    fn on_client_readable(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        match conn.read_data() {
            Ok(eof) => {
                if eof {
                    conn.session.wait_outcome = Some(WaitOutcome::Eof);
                    self.drive(token);
                    return;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {
                conn.session.wait_outcome = Some(WaitOutcome::Error);
                self.drive(token);
                return;
            }
        }

        match conn.try_parse() {
            Ok(()) => {
                conn.session.wait_outcome = Some(WaitOutcome::Complete);
                self.drive(token);
            }
            Err(crate::http::ParseError::IncompleteRequestLine) => {
                // More bytes needed; stay registered for READABLE and wait
                // for the next event.
            }
            Err(e) => {
                conn.session.parse_error_code = Some(e.status_code());
                conn.session.wait_outcome = Some(WaitOutcome::Complete);
                self.drive(token);
            }
        }
    }

    fn flush_write(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let drained = conn.write_data();
        if !drained {
            return;
        }
        if conn.should_close() {
            self.close_conn(token);
            return;
        }
        if matches!(conn.session.state, State::Wait) && conn.session.request.is_none() {
            let _ = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::READABLE);
        }
    }

    fn close_conn(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            conn.shutdown();
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    // ---- driving the session state machine -----------------------------

    /// Runs `step` until the session releases, capturing deliver/stream
    /// body bytes at the exact transition boundary before the next `step`
    /// call consumes the source object (see `http::response`).
    fn drive(&mut self, token: Token) {
        loop {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            let engine = Engine {
                cache: &self.shared.cache,
                storage: &self.shared.storage,
                expiry: &self.shared.expiry,
                stats: &self.shared.stats,
                policy: self.shared.policy.as_ref(),
                params: &conn.s_cfg.engine,
            };

            let before = conn.session.state;
            let result = engine.step(&mut conn.session);
            let after = conn.session.state;

            let body_to_queue = match (before, after) {
                (State::PrepResp, State::Deliver) => {
                    Some(response::extract_deliver_body(&conn.session))
                }
                _ => None,
            };
            let stream_started = matches!((before, after), (State::PrepResp, State::StreamBody));
            let woken = std::mem::take(&mut conn.session.woken);

            if let Some(body) = body_to_queue {
                self.queue_response(token, body);
            }
            if stream_started {
                // Headers only — the reactor pumps body chunks in as they
                // arrive from the backend (`pump_fetch_body`), rather than
                // a `Session` handler producing the whole body up front.
                self.queue_response_headers(token);
            }
            if !woken.is_empty() {
                self.wake_others(woken);
            }

            if result == StepResult::Continue {
                continue;
            }

            // Released. Figure out what the reactor owes this session.
            match after {
                State::Lookup => {
                    self.park(token);
                }
                State::Fetch => {
                    self.ensure_fetch(token);
                }
                State::Pipe => {
                    self.start_pipe(token);
                }
                State::Wait => {
                    self.after_release_wait(token);
                }
                _ => {}
            }
            return;
        }
    }

    fn queue_response(&mut self, token: Token, body: Vec<u8>) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let head = response::build_http(&conn.session, &body);
        let mut bytes = head.to_bytes_headers_only();
        if conn.session.wantbody {
            bytes.extend_from_slice(&response::write_object(conn.session.res_mode, &body));
            bytes.extend_from_slice(&response::stream_end(conn.session.res_mode));
        }
        conn.write_buffer.extend_from_slice(&bytes);
        let _ = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
    }

    /// Writes just the status line and header block for a response whose
    /// body is still arriving from the backend (`streambody`'s streaming
    /// path). `pump_fetch_body` appends the framed body chunks, and a
    /// later `stream_end` call, once the fetch finishes.
    fn queue_response_headers(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let head = response::build_http(&conn.session, &[]);
        conn.write_buffer.extend_from_slice(&head.to_bytes_headers_only());
        let _ = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
    }

    fn after_release_wait(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if let Some(req) = conn.session.request.as_mut() {
            req.finish_request();
        }
        conn.touch();
        if conn.write_buffer.is_empty() {
            let _ = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::READABLE);
        }
    }

    fn park(&mut self, token: Token) {
        let Some(conn) = self.conns.remove(&token) else {
            return;
        };
        let digest = conn.session.digest.expect("lookup requires a digest");
        if let Some(head) = self.shared.cache.deref(&digest) {
            head.lock()
                .unwrap()
                .park(ParkedSession { worker: self.id, token: token.0 });
        }
        self.parked.insert(token, conn);
    }

    // ---- backend fetch ---------------------------------------------------

    fn ensure_fetch(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if matches!(conn.action, ActiveAction::Fetch(_)) {
            return;
        }
        let Some(req) = conn.session.request.as_ref() else {
            conn.session.status = 503;
            conn.session.state = State::Error;
            drop(conn);
            self.drive(token);
            return;
        };
        let Ok(route) = router::find_route(&conn.s_cfg, &req.url, &req.method) else {
            conn.session.status = 404;
            conn.session.state = State::Error;
            drop(conn);
            self.drive(token);
            return;
        };
        let Some(backend) = conn.s_cfg.find_backend(&route.backend).cloned() else {
            conn.session.status = 502;
            conn.session.state = State::Error;
            drop(conn);
            self.drive(token);
            return;
        };
        let bereq = conn.session.bereq.as_ref().unwrap_or(req);
        let host = bereq
            .headers
            .get("host")
            .cloned()
            .unwrap_or_else(|| backend.host.clone());
        let req_bytes = crate::backend::build_request(
            bereq.method.as_str(),
            &bereq.url,
            &host,
            &bereq.headers,
            &bereq.body,
            conn.s_cfg.engine.http_gzip_support,
        );

        let read_buf_size = conn.s_cfg.engine.gzip_stack_buffer;
        match FetchSession::connect(&backend, req_bytes, read_buf_size) {
            Ok(mut fetch) => {
                let backend_token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(
                    &mut fetch.stream,
                    backend_token,
                    Interest::WRITABLE,
                ) {
                    proxy_log::errors!("worker {} backend register failed: {}", self.id, e);
                    conn.session.backend_response = Some(fatal_fetch_failure());
                    drop(conn);
                    self.drive(token);
                    return;
                }
                self.peer_tokens.insert(backend_token, token);
                conn.action = ActiveAction::Fetch(fetch);
            }
            Err(e) => {
                proxy_log::warn!("worker {} backend connect failed: {}", self.id, e);
                conn.session.backend_response = Some(fatal_fetch_failure());
                drop(conn);
                self.drive(token);
            }
        }
    }

    fn handle_peer_event(&mut self, peer_token: Token, client_token: Token, event: &Event) {
        let is_pipe = self
            .conns
            .get(&client_token)
            .map(|c| matches!(c.action, ActiveAction::Pipe(_)))
            .unwrap_or(false);
        if is_pipe {
            self.handle_pipe_backend_event(peer_token, client_token, event);
        } else {
            self.handle_fetch_event(peer_token, client_token, event);
        }
    }

    fn handle_fetch_event(&mut self, peer_token: Token, client_token: Token, event: &Event) {
        let Some(conn) = self.conns.get_mut(&client_token) else {
            self.peer_tokens.remove(&peer_token);
            return;
        };
        let ActiveAction::Fetch(fetch) = &mut conn.action else {
            self.peer_tokens.remove(&peer_token);
            return;
        };

        if event.is_writable() {
            match fetch.write_request() {
                FetchWriteOutcome::Complete => {
                    let _ = self.poll.registry().reregister(
                        &mut fetch.stream,
                        peer_token,
                        Interest::READABLE,
                    );
                }
                FetchWriteOutcome::Pending => {}
                FetchWriteOutcome::NeedsRetry | FetchWriteOutcome::Error => {
                    self.finish_fetch(client_token, peer_token, fatal_fetch_failure());
                    return;
                }
            }
        }

        if !event.is_readable() {
            return;
        }

        let already_streaming = self
            .conns
            .get(&client_token)
            .map(|c| matches!(c.session.state, State::StreamBody))
            .unwrap_or(false);
        if already_streaming {
            self.continue_streaming_fetch(client_token, peer_token);
            return;
        }

        let Some(conn) = self.conns.get_mut(&client_token) else {
            return;
        };
        let ActiveAction::Fetch(fetch) = &mut conn.action else {
            return;
        };
        let progress = match fetch.poll() {
            Ok(progress) => progress,
            Err(_) => {
                self.finish_fetch(client_token, peer_token, fatal_fetch_failure());
                return;
            }
        };

        if progress.headers_just_became_ready && self.predict_streaming(client_token) {
            self.dispatch_fetch_headers(client_token, peer_token);
            let streaming_ok = self
                .conns
                .get(&client_token)
                .map(|c| matches!(c.session.state, State::StreamBody))
                .unwrap_or(false);
            if streaming_ok && (progress.has_new_body || progress.done) {
                self.pump_fetch_body(client_token, peer_token, progress.done);
            }
            return;
        }

        if progress.done {
            let Some(conn) = self.conns.get_mut(&client_token) else {
                return;
            };
            let ActiveAction::Fetch(fetch) = &mut conn.action else {
                return;
            };
            let resp = BackendResponse {
                status: fetch.status,
                headers: fetch.resp_headers.clone(),
                body: fetch.body.clone(),
                from_recycled_conn: fetch.origin == ConnOrigin::Recycled,
                retryable_failure: false,
                fatal_failure: false,
            };
            self.finish_fetch(client_token, peer_token, resp);
        }
    }

    /// Predicts whether the fetch now sitting in `client_token`'s
    /// `ActiveAction::Fetch` will stream once dispatched to `fetch`/
    /// `fetchbody`, using the exact same rule (`session::compute_do_stream`)
    /// those handlers use, so this can never disagree with what actually
    /// happens once `dispatch_fetch_headers` drives the engine.
    fn predict_streaming(&self, client_token: Token) -> bool {
        let Some(conn) = self.conns.get(&client_token) else {
            return false;
        };
        let ActiveAction::Fetch(fetch) = &conn.action else {
            return false;
        };
        let content_encoding = fetch
            .resp_headers
            .iter()
            .find(|(k, _)| k == "content-encoding")
            .map(|(_, v)| v.clone());
        let do_gzip = conn.s_cfg.engine.http_gzip_support && self.shared.policy.do_gzip();
        let do_gunzip = conn.s_cfg.engine.http_gzip_support && self.shared.policy.do_gunzip();
        let (filter, _) = crate::filters::negotiate_encoding(content_encoding.as_deref(), do_gunzip, do_gzip);
        let client_has_conditional = conn.session.request.as_ref().map_or(false, |r| {
            r.headers.contains_key("if-modified-since") || r.headers.contains_key("if-none-match")
        });
        crate::session::compute_do_stream(
            self.shared.policy.as_ref(),
            fetch.status,
            conn.session.wantbody,
            conn.session.esi_level,
            client_has_conditional,
            filter,
        )
    }

    /// Hands the just-parsed response status/headers to the engine as a
    /// headers-only `BackendResponse` and drives `fetch`/`fetchbody`/
    /// `prepresp` in one go. If the engine didn't actually land on
    /// `StreamBody` (storage exhausted, or any other divergence from
    /// `predict_streaming`'s guess), the engine has already produced and
    /// queued an error response on its own; this just tears down the now
    /// unneeded backend socket.
    fn dispatch_fetch_headers(&mut self, client_token: Token, peer_token: Token) {
        let Some(conn) = self.conns.get_mut(&client_token) else {
            return;
        };
        let ActiveAction::Fetch(fetch) = &conn.action else {
            return;
        };
        let resp = BackendResponse {
            status: fetch.status,
            headers: fetch.resp_headers.clone(),
            body: Vec::new(),
            from_recycled_conn: fetch.origin == ConnOrigin::Recycled,
            retryable_failure: false,
            fatal_failure: false,
        };
        conn.session.backend_response = Some(resp);
        self.drive(client_token);

        let streaming = self
            .conns
            .get(&client_token)
            .map(|c| matches!(c.session.state, State::StreamBody))
            .unwrap_or(false);
        if !streaming {
            self.peer_tokens.remove(&peer_token);
            if let Some(conn) = self.conns.get_mut(&client_token) {
                if let ActiveAction::Fetch(fetch) = std::mem::take(&mut conn.action) {
                    let mut stream = fetch.stream;
                    let _ = self.poll.registry().deregister(&mut stream);
                }
            }
        }
    }

    /// Polls the backend socket for one readable event on an
    /// already-streaming fetch and pumps whatever body bytes it yields.
    fn continue_streaming_fetch(&mut self, client_token: Token, peer_token: Token) {
        let Some(conn) = self.conns.get_mut(&client_token) else {
            self.peer_tokens.remove(&peer_token);
            return;
        };
        let ActiveAction::Fetch(fetch) = &mut conn.action else {
            self.peer_tokens.remove(&peer_token);
            return;
        };
        match fetch.poll() {
            Ok(progress) => {
                if progress.has_new_body || progress.done {
                    self.pump_fetch_body(client_token, peer_token, progress.done);
                }
            }
            Err(_) => {
                // Headers and part of the body are already on the wire;
                // there's no status left to change. Close out the chunked
                // stream with whatever arrived and let the client see a
                // short read.
                self.pump_fetch_body(client_token, peer_token, true);
            }
        }
    }

    /// Drains and frames whatever new body bytes the backend fetch has
    /// produced straight into the client's write buffer, and on `done`
    /// finalizes the chunked stream and tears down the backend socket.
    fn pump_fetch_body(&mut self, client_token: Token, peer_token: Token, done: bool) {
        let Some(conn) = self.conns.get_mut(&client_token) else {
            self.peer_tokens.remove(&peer_token);
            return;
        };
        let ActiveAction::Fetch(fetch) = &mut conn.action else {
            self.peer_tokens.remove(&peer_token);
            return;
        };
        let chunk = fetch.take_new_body();
        if let Some(busy) = conn.session.busyobj.as_mut() {
            // Accumulated for `streambody` to store in the cache once the
            // fetch finishes — always the raw bytes off the wire, even when
            // the client gets a gunzipped copy below, since the object is
            // cached in whatever form the backend sent it.
            busy.body.extend_from_slice(&chunk);
        }
        let needs_gunzip = conn.session.res_mode & crate::session::response_mode::RES_GUNZIP != 0;
        let out_chunk = if needs_gunzip { fetch.gunzip_chunk(&chunk) } else { chunk };
        if !out_chunk.is_empty() {
            let framed = response::write_object(conn.session.res_mode, &out_chunk);
            conn.write_buffer.extend_from_slice(&framed);
        }
        if done {
            if needs_gunzip {
                let trailing = fetch.finish_gunzip();
                if !trailing.is_empty() {
                    conn.write_buffer
                        .extend_from_slice(&response::write_object(conn.session.res_mode, &trailing));
                }
            }
            conn.write_buffer
                .extend_from_slice(&response::stream_end(conn.session.res_mode));
            conn.session.backend_body_done = true;
        }
        let _ = self.poll.registry().reregister(
            &mut conn.stream,
            client_token,
            Interest::READABLE | Interest::WRITABLE,
        );

        if !done {
            return;
        }

        self.peer_tokens.remove(&peer_token);
        if let Some(conn) = self.conns.get_mut(&client_token) {
            if let ActiveAction::Fetch(fetch) = std::mem::take(&mut conn.action) {
                let mut stream = fetch.stream;
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        self.drive(client_token);
    }

    fn finish_fetch(&mut self, client_token: Token, peer_token: Token, resp: BackendResponse) {
        self.peer_tokens.remove(&peer_token);
        if let Some(conn) = self.conns.get_mut(&client_token) {
            if let ActiveAction::Fetch(fetch) = std::mem::take(&mut conn.action) {
                let mut stream = fetch.stream;
                let _ = self.poll.registry().deregister(&mut stream);
            }
            conn.session.backend_response = Some(resp);
        }
        self.drive(client_token);
    }

    fn wake_others(&mut self, woken: Vec<ParkedSession>) {
        for parked in woken {
            if parked.worker == self.id {
                self.resume_parked(Token(parked.token));
            } else if let Some(handle) = self.shared_worker(parked.worker) {
                let _ = handle.sender.send(WorkerMsg::WakeParked(parked.token));
                let _ = handle.waker.wake();
            }
        }
    }

    fn shared_worker(&self, id: usize) -> Option<&WorkerHandle> {
        self.shared.workers.get(id)
    }

    // ---- pipe -------------------------------------------------------------

    fn start_pipe(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let Some(req) = conn.session.request.as_ref() else {
            self.close_conn(token);
            return;
        };
        let Ok(route) = router::find_route(&conn.s_cfg, &req.url, &req.method) else {
            self.close_conn(token);
            return;
        };
        let Some(backend) = conn.s_cfg.find_backend(&route.backend).cloned() else {
            self.close_conn(token);
            return;
        };
        match connect_backend(&backend) {
            Ok(mut stream) => {
                let peer_token = self.alloc_token();
                if self
                    .poll
                    .registry()
                    .register(&mut stream, peer_token, Interest::READABLE)
                    .is_err()
                {
                    self.close_conn(token);
                    return;
                }
                self.peer_tokens.insert(peer_token, token);
                self.client_peer.insert(token, peer_token);
                conn.action = ActiveAction::Pipe(stream);
            }
            Err(_) => self.close_conn(token),
        }
    }

    fn pipe_client_to_backend(&mut self, client_token: Token) {
        let Some(&peer_token) = self.client_peer.get(&client_token) else {
            return;
        };
        let mut buf = [0u8; READ_BUF_SIZE];
        let Some(conn) = self.conns.get_mut(&client_token) else {
            return;
        };
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.teardown_pipe(client_token, peer_token);
                    return;
                }
                Ok(n) => {
                    let Some(conn) = self.conns.get_mut(&client_token) else { return };
                    if let ActiveAction::Pipe(backend) = &mut conn.action {
                        let _ = backend.write_all(&buf[..n]);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.teardown_pipe(client_token, peer_token);
                    return;
                }
            }
        }
    }

    fn handle_pipe_backend_event(&mut self, peer_token: Token, client_token: Token, event: &Event) {
        if !event.is_readable() {
            return;
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let Some(conn) = self.conns.get_mut(&client_token) else {
                return;
            };
            let ActiveAction::Pipe(backend) = &mut conn.action else {
                return;
            };
            match backend.read(&mut buf) {
                Ok(0) => {
                    self.teardown_pipe(client_token, peer_token);
                    return;
                }
                Ok(n) => {
                    conn.write_buffer.extend_from_slice(&buf[..n]);
                    let _ = self.poll.registry().reregister(
                        &mut conn.stream,
                        client_token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.teardown_pipe(client_token, peer_token);
                    return;
                }
            }
        }
    }

    fn teardown_pipe(&mut self, client_token: Token, peer_token: Token) {
        self.peer_tokens.remove(&peer_token);
        self.client_peer.remove(&client_token);
        if let Some(conn) = self.conns.get_mut(&client_token) {
            if let ActiveAction::Pipe(mut backend) = std::mem::take(&mut conn.action) {
                let _ = self.poll.registry().deregister(&mut backend);
            }
        }
        self.close_conn(client_token);
    }

    // ---- timeouts ----------------------------------------------------------

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let stale: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                now.duration_since(conn.last_activity) > Duration::from_millis(60_000)
            })
            .map(|(&t, _)| t)
            .collect();
        for token in stale {
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.session.wait_outcome = Some(WaitOutcome::Timeout);
                if matches!(conn.session.state, State::Wait) {
                    self.close_conn(token);
                }
            }
        }
        let expired = self.shared.expiry.lock().unwrap().sweep_expired();
        for digest in expired {
            let (object, woken) = self.shared.cache.evict(&digest);
            if let Some(handle) = object {
                self.shared.storage.release(&handle);
            }
            if !woken.is_empty() {
                self.wake_others(woken);
            }
        }
    }
}

fn fatal_fetch_failure() -> BackendResponse {
    BackendResponse {
        status: 503,
        headers: Vec::new(),
        body: Vec::new(),
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: true,
    }
}

fn connect_backend(backend: &BackendConfig) -> std::io::Result<TcpStream> {
    use std::net::ToSocketAddrs;
    let addr = (backend.host.as_str(), backend.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "backend did not resolve"))?;
    TcpStream::connect(addr)
}
