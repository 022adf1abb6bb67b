//! The session state machine — the heart of this crate. A step dispatcher
//! plus one handler per state, matching the transition table exactly:
//! `first, wait, start, recv, lookup, hit, miss, pass, pipe, fetch,
//! fetchbody, streambody, prepresp, deliver, error, done`.
//!
//! The handlers below are pure with respect to socket I/O: reading the
//! client's bytes, driving the non-blocking backend connection, and
//! writing the response to the wire are the reactor's job (`server.rs`),
//! which feeds this engine the inputs each I/O-dependent handler needs
//! (`WaitOutcome`, a parsed `HttpRequest`, a `BackendResponse`) and reads
//! back what to write from `Session::obj`/`busyobj`/`response_headers`.
//! This mirrors the source's own split between `CNT_Session` (pure state
//! logic) and the acceptor/waiter/backend layers it calls into as named
//! external contracts — kept as named contracts here too (§6), not
//! reimplemented inline.

use crate::cache::{Cache, LookupResult, ObjHead, ParkedSession};
use crate::config::EngineParams;
use crate::expiry::{ExpRecord, ExpiryEngine};
use crate::filters::{self, FilterKind};
use crate::http::{HttpRequest, Method};
use crate::policy::{
    DeliverAction, ErrorAction, FetchAction, HitAction, MissAction, PassAction, PipeAction, Policy,
    RecvAction,
};
use crate::stats::Stats;
use crate::storage::Storage;
use crate::workspace::{Mark, Workspace};
use proxy_log::{WorkerLog, wsp};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub mod response_mode {
    pub const RES_LEN: u16 = 0b00_0001;
    pub const RES_CHUNKED: u16 = 0b00_0010;
    pub const RES_EOF: u16 = 0b00_0100;
    pub const RES_ESI: u16 = 0b00_1000;
    pub const RES_ESI_CHILD: u16 = 0b01_0000;
    pub const RES_GUNZIP: u16 = 0b10_0000;
}
use response_mode::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    First,
    Wait,
    Start,
    Recv,
    Lookup,
    Hit,
    Miss,
    Pass,
    Pipe,
    Fetch,
    FetchBody,
    StreamBody,
    PrepResp,
    Deliver,
    Error,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Release,
}

/// Fixed short reasons a session's socket is closed for — §7's taxonomy.
pub mod close_reason {
    pub const JUNK: &str = "junk";
    pub const OVERFLOW: &str = "overflow";
    pub const EOF: &str = "EOF";
    pub const ERROR: &str = "error";
    pub const REMOTE_CLOSED: &str = "remote closed";
    pub const STREAM_ERROR: &str = "Stream error";
    pub const OUT_OF_OBJECTS: &str = "Out of objects";
    pub const EOF_MODE: &str = "EOF mode";
}

/// What `wait` learned about the receive buffer — supplied by the
/// reactor, since only it knows whether the socket is readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Complete,
    Timeout,
    Overflow,
    Eof,
    Error,
}

/// A fully-read backend response, handed to `fetch` by whichever layer
/// drove the non-blocking socket (`backend::FetchSession` in the real
/// reactor, a hand-built value in tests).
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// The connection handle used for this fetch had been pulled out of
    /// a keep-alive pool (vs. freshly connected) — gates the
    /// retry-once-on-recycled-connection rule.
    pub from_recycled_conn: bool,
    pub retryable_failure: bool,
    pub fatal_failure: bool,
}

/// Baseline copy of the original request, restored verbatim on restart
/// (§9 "Restart" in the GLOSSARY).
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RequestSnapshot {
    pub fn from_request(req: &HttpRequest) -> Self {
        Self {
            method: req.method.clone(),
            url: req.url.clone(),
            version: req.version.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
        }
    }
}

/// Transient record tracking an in-progress fetch (§3 BusyObj).
#[derive(Debug, Clone)]
pub struct BusyObj {
    pub headers: Vec<(String, String)>,
    pub status: u16,
    pub filter: FilterKind,
    pub do_stream: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub is_gzip: bool,
    pub exp: ExpRecord,
    pub body: Vec<u8>,
}

/// The unit of work. One per client connection (or ESI child request
/// sharing the parent's connection, §C.8).
pub struct Session {
    pub peer: Option<SocketAddr>,
    pub xid: u64,
    pub state: State,
    pub restarts: u32,
    pub esi_level: u32,
    pub t_open: Option<Instant>,
    pub t_req: Option<Instant>,
    pub t_resp: Option<Instant>,
    pub t_end: Option<Instant>,

    pub request: Option<HttpRequest>,
    pub http0: Option<RequestSnapshot>,
    pub response_headers: Vec<(String, String)>,

    pub workspace: Workspace,
    pub session_mark: Option<Mark>,
    pub request_mark: Option<Mark>,

    pub digest: Option<[u8; 32]>,

    pub wantbody: bool,
    pub sendbody: bool,
    pub disable_esi: bool,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,
    pub doclose: Option<&'static str>,

    pub director: Option<String>,
    pub obj: Option<Arc<Mutex<ObjHead>>>,
    /// Whether `obj` is the real hash-table entry acquired from `lookup`'s
    /// miss branch (eligible to be published via `unbusy`/found by future
    /// lookups) versus a scratch objhead `pass`/`error` use purely to carry
    /// a fetched/synthesized body to `deliver` — never true for the latter.
    pub obj_cacheable: bool,
    pub busyobj: Option<BusyObj>,
    /// The backend-bound request built by `miss` (forced `GET`, `R_FETCH`
    /// header-class filtering) — `None` on the `pass`/`pipe` paths, which
    /// send the client's request through largely as-is.
    pub bereq: Option<HttpRequest>,

    pub res_mode: u16,
    pub status: u16,

    pub wait_outcome: Option<WaitOutcome>,
    pub backend_response: Option<BackendResponse>,
    pub parse_error_code: Option<u16>,

    pub log: WorkerLog,

    /// Set by the reactor once a fetch's body has been fully read from
    /// the backend. `streambody` parks on this rather than finalizing the
    /// moment `prepresp` hands it control, since a streaming fetch's body
    /// is still arriving at that point.
    pub backend_body_done: bool,

    /// Set true by `done` when the session should be destroyed rather
    /// than recycled (closed socket, fatal error).
    pub destroy: bool,

    /// Sessions a waiting-list drain (`unbusy`/`drop_entry`) just woke up,
    /// accumulated here because the handler that triggers the drain has
    /// no way to hand them back except through `sess` itself. The reactor
    /// drains this after every `step`/`run` call and re-dispatches each
    /// one into `lookup` on whichever worker it names.
    pub woken: Vec<ParkedSession>,
}

impl Session {
    pub fn new(xid_seed: u64, workspace_size: usize, peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            xid: 0,
            state: State::First,
            restarts: 0,
            esi_level: 0,
            t_open: None,
            t_req: None,
            t_resp: None,
            t_end: None,
            request: None,
            http0: None,
            response_headers: Vec::new(),
            workspace: Workspace::new(workspace_size),
            session_mark: None,
            request_mark: None,
            digest: None,
            wantbody: true,
            sendbody: false,
            disable_esi: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
            doclose: None,
            director: None,
            obj: None,
            obj_cacheable: false,
            busyobj: None,
            bereq: None,
            res_mode: 0,
            status: 200,
            wait_outcome: None,
            backend_response: None,
            parse_error_code: None,
            log: WorkerLog::new(xid_seed),
            backend_body_done: false,
            destroy: false,
            woken: Vec::new(),
        }
    }

    /// §3 invariant: `xid == 0 ⇔ state is first | wait`.
    pub fn assert_xid_invariant(&self) {
        let at_boundary = matches!(self.state, State::First | State::Wait);
        debug_assert_eq!(self.xid == 0, at_boundary);
    }
}

/// Global, monotonically increasing request id counter (§5, §9: must be
/// atomic in a concurrent port).
static XID_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub fn next_xid() -> u64 {
    XID_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

pub fn debug_set_xid(value: u64) {
    XID_COUNTER.store(value, std::sync::atomic::Ordering::Relaxed);
}

pub fn debug_get_xid() -> u64 {
    XID_COUNTER.load(std::sync::atomic::Ordering::Relaxed)
}

/// The shared collaborators every handler needs: cache, storage, expiry,
/// stats, policy, and the tunable engine parameters. Borrowed for the
/// duration of a single `step`/`run` call — nothing here is per-session.
pub struct Engine<'a> {
    pub cache: &'a Cache,
    pub storage: &'a Storage,
    pub expiry: &'a Mutex<ExpiryEngine>,
    pub stats: &'a Stats,
    pub policy: &'a dyn Policy,
    pub params: &'a EngineParams,
}

impl<'a> Engine<'a> {
    /// Drives `sess` through one handler call. Returns `Release` when the
    /// worker must stop touching the session (parked, closed, or handed
    /// to another subsystem).
    pub fn step(&self, sess: &mut Session) -> StepResult {
        self.diag(sess);
        match sess.state {
            State::First => self.first(sess),
            State::Wait => self.wait(sess),
            State::Start => self.start(sess),
            State::Recv => self.recv(sess),
            State::Lookup => self.lookup(sess),
            State::Hit => self.hit(sess),
            State::Miss => self.miss(sess),
            State::Pass => self.pass(sess),
            State::Pipe => self.pipe(sess),
            State::Fetch => self.fetch(sess),
            State::FetchBody => self.fetchbody(sess),
            State::StreamBody => self.streambody(sess),
            State::PrepResp => self.prepresp(sess),
            State::Deliver => self.deliver(sess),
            State::Error => self.error(sess),
            State::Done => self.done(sess),
        }
    }

    /// Runs `step` in a loop until the session is released. The legal
    /// entry points are `first`, `start`, `lookup`, `recv` (§4.1); callers
    /// resuming a parked session set `sess.state` to one of those before
    /// calling `run`.
    pub fn run(&self, sess: &mut Session) {
        loop {
            if self.step(sess) == StepResult::Release {
                return;
            }
        }
    }

    /// `cnt_diag` (§C.1): a trace line per transition, gated on
    /// `diag_bitmap` so it costs nothing when unset.
    fn diag(&self, sess: &Session) {
        if self.params.diag_bitmap != 0 {
            proxy_log::trace!("state={:?} xid={}", sess.state, sess.xid);
        }
    }

    // ---- first --------------------------------------------------------

    fn first(&self, sess: &mut Session) -> StepResult {
        sess.session_mark = Some(sess.workspace.snapshot());
        sess.t_open = Some(Instant::now());
        sess.xid = 0;
        sess.state = State::Wait;
        StepResult::Continue
    }

    // ---- wait -----------------------------------------------------------

    fn wait(&self, sess: &mut Session) -> StepResult {
        match sess.wait_outcome.take() {
            Some(WaitOutcome::Complete) => {
                sess.state = State::Start;
                StepResult::Continue
            }
            Some(WaitOutcome::Overflow) => {
                sess.doclose = Some(close_reason::OVERFLOW);
                sess.destroy = true;
                sess.state = State::Done;
                StepResult::Continue
            }
            Some(WaitOutcome::Eof) => {
                sess.doclose = Some(close_reason::EOF);
                sess.destroy = true;
                sess.state = State::Done;
                StepResult::Continue
            }
            Some(WaitOutcome::Error) => {
                sess.doclose = Some(close_reason::ERROR);
                sess.destroy = true;
                sess.state = State::Done;
                StepResult::Continue
            }
            // No outcome supplied yet, or a plain timeout: park the
            // session. The reactor re-enters `run` once the socket is
            // readable or the linger expires again.
            Some(WaitOutcome::Timeout) | None => StepResult::Release,
        }
    }

    // ---- start ----------------------------------------------------------

    fn start(&self, sess: &mut Session) -> StepResult {
        sess.xid = next_xid();
        sess.t_req = Some(Instant::now());
        wsp!(sess.log, "ReqStart", "xid={} peer={:?}", sess.xid, sess.peer);

        let Some(req) = sess.request.as_ref() else {
            sess.doclose = Some(close_reason::JUNK);
            sess.destroy = true;
            sess.state = State::Done;
            return StepResult::Continue;
        };

        if let Some(code) = sess.parse_error_code.take() {
            if code == 400 {
                sess.doclose = Some(close_reason::JUNK);
                sess.destroy = true;
                sess.state = State::Done;
                return StepResult::Continue;
            }
            sess.status = code;
            sess.state = State::Error;
            return StepResult::Continue;
        }

        sess.request_mark = Some(sess.workspace.snapshot());
        sess.http0 = Some(RequestSnapshot::from_request(req));

        sess.doclose = req
            .headers
            .get("connection")
            .filter(|v| v.eq_ignore_ascii_case("close"))
            .map(|_| close_reason::ERROR);

        if let Some(expect) = req.headers.get("expect") {
            if !expect.eq_ignore_ascii_case("100-continue") {
                sess.status = 417;
                sess.state = State::Error;
                return StepResult::Continue;
            }
            sess.response_headers.push((
                "__interim__".to_string(),
                "HTTP/1.1 100 Continue\r\n\r\n".to_string(),
            ));
        }

        sess.state = State::Recv;
        StepResult::Continue
    }

    // ---- recv -----------------------------------------------------------

    fn recv(&self, sess: &mut Session) -> StepResult {
        if sess.restarts > self.params.max_restarts {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        }

        let Some(req) = sess.request.as_mut() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };

        sess.director = Some("default".to_string());
        sess.wantbody = req.method != Method::HEAD;
        sess.sendbody = false;

        let action = self.policy.recv(req);

        if !matches!(action, RecvAction::Pipe | RecvAction::Pass) && self.params.http_gzip_support {
            normalize_accept_encoding(req);
        }

        let key = self.policy.hash_key(req);
        sess.digest = Some(sha256_digest(&key));

        match action {
            RecvAction::Lookup => {
                sess.state = State::Lookup;
            }
            RecvAction::Pass => {
                sess.state = State::Pass;
            }
            RecvAction::Pipe => {
                debug_assert!(sess.esi_level == 0, "pipe is illegal inside an ESI child");
                sess.state = State::Pipe;
            }
            RecvAction::Error(code) => {
                sess.status = code;
                sess.state = State::Error;
            }
        }
        StepResult::Continue
    }

    // ---- lookup -----------------------------------------------------------

    fn lookup(&self, sess: &mut Session) -> StepResult {
        let digest = sess.digest.expect("lookup requires a digest from recv");
        match self.cache.lookup(digest, sess.hash_ignore_busy) {
            LookupResult::Busy => {
                // Parked behind a busy peer; the reactor is responsible
                // for registering us on the objhead's waiting list via
                // `ObjHead::park` and re-entering `run` at `lookup` later.
                // No vary blob to reserve here — this session isn't the
                // one that will fetch or validate anything.
                StepResult::Release
            }
            LookupResult::Miss(head) => {
                self.reserve_vary_blob(sess, true);
                sess.obj = Some(head);
                sess.obj_cacheable = true;
                sess.state = State::Miss;
                StepResult::Continue
            }
            LookupResult::Hit(head) => {
                self.reserve_vary_blob(sess, false);
                let is_pass = head.lock().unwrap().is_hit_for_pass();
                sess.obj = Some(head);
                // Same table entry a `Miss` would hold, just already
                // populated — `deliver` must not release its storage out
                // from under a hit shared with every other session that
                // hashes to this digest.
                sess.obj_cacheable = true;
                if is_pass {
                    Stats::incr(&self.stats.cache_hitpass);
                    wsp!(sess.log, "HitPass", "xid={}", sess.xid);
                    sess.state = State::Pass;
                } else {
                    Stats::incr(&self.stats.cache_hit);
                    wsp!(sess.log, "Hit", "xid={}", sess.xid);
                    sess.state = State::Hit;
                }
                StepResult::Continue
            }
        }
    }

    // ---- hit -----------------------------------------------------------

    fn hit(&self, sess: &mut Session) -> StepResult {
        let Some(req) = sess.request.as_ref() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };
        match self.policy.hit(req) {
            HitAction::Deliver => {
                if let Some(req) = sess.request.as_mut() {
                    req.body.clear();
                }
                sess.state = State::PrepResp;
            }
            HitAction::Pass => {
                sess.obj = None;
                sess.state = State::Pass;
            }
            HitAction::Error(code) => {
                sess.status = code;
                sess.state = State::Error;
            }
            HitAction::Restart => {
                self.restart(sess);
            }
        }
        StepResult::Continue
    }

    // ---- miss -----------------------------------------------------------

    fn miss(&self, sess: &mut Session) -> StepResult {
        sess.workspace.reset(sess.request_mark.unwrap_or(sess.workspace.snapshot()));
        let Some(req) = sess.request.as_ref() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };
        let mut bereq = req.clone();
        bereq.method = Method::GET;
        bereq.body.clear();
        filter_r_fetch_headers(&mut bereq.headers);

        Stats::incr(&self.stats.cache_miss);
        match self.policy.miss(&bereq) {
            MissAction::Fetch => {
                sess.bereq = Some(bereq);
                sess.state = State::Fetch;
            }
            MissAction::Pass => {
                self.drop_busy(sess);
                sess.state = State::Pass;
            }
            MissAction::Error(code) => {
                self.drop_busy(sess);
                sess.status = code;
                sess.state = State::Error;
            }
        }
        StepResult::Continue
    }

    // ---- pass -----------------------------------------------------------

    fn pass(&self, sess: &mut Session) -> StepResult {
        sess.workspace.reset(sess.request_mark.unwrap_or(sess.workspace.snapshot()));
        let Some(req) = sess.request.as_ref() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };
        match self.policy.pass(req) {
            PassAction::Error(code) => {
                sess.status = code;
                sess.state = State::Error;
            }
            PassAction::Pass => {
                sess.sendbody = true;
                let digest = sess.digest.unwrap_or([0u8; 32]);
                sess.obj = Some(self.cache.prealloc(digest));
                sess.obj_cacheable = false;
                sess.state = State::Fetch;
            }
        }
        StepResult::Continue
    }

    // ---- pipe -----------------------------------------------------------

    fn pipe(&self, sess: &mut Session) -> StepResult {
        let Some(req) = sess.request.as_ref() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };
        let _ = self.policy.pipe(req);
        // The actual byte-shuttling between client and backend socket is
        // the reactor's job (`PipeSession`, §6); once it reports both
        // ends closed it drives the session to `done` directly.
        sess.destroy = true;
        sess.state = State::Done;
        StepResult::Continue
    }

    // ---- fetch -----------------------------------------------------------

    fn fetch(&self, sess: &mut Session) -> StepResult {
        let Some(resp) = sess.backend_response.take() else {
            // Headers not read yet; release so the reactor can drive the
            // non-blocking backend socket and call back into `fetch` once
            // a `BackendResponse` is attached.
            sess.backend_response = None;
            return StepResult::Release;
        };

        if resp.fatal_failure || (resp.retryable_failure && !resp.from_recycled_conn) {
            Stats::incr(&self.stats.backend_fail);
            self.drop_busy(sess);
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        }
        if resp.retryable_failure && resp.from_recycled_conn {
            // One retry on a recycled connection (§C.4): the reactor is
            // expected to reconnect fresh and resend, then call `fetch`
            // again with the retried response. We only see this branch
            // if it gave up after the retry too.
            Stats::incr(&self.stats.backend_fail);
            self.drop_busy(sess);
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        }

        Stats::incr(&self.stats.backend_fetch);

        let headers = canonicalize_multiline(&resp.headers);
        let content_encoding = headers
            .iter()
            .find(|(k, _)| k == "content-encoding")
            .map(|(_, v)| v.clone());

        let ttl = if sess.sendbody && sess.obj.as_ref().map_or(false, |o| o.lock().unwrap().is_hit_for_pass()) {
            Duration::from_secs(0)
        } else {
            ttl_from_headers(&headers, self.params)
        };

        let action = self.policy.fetch(resp.status);
        sess.status = resp.status;

        let do_gzip = self.params.http_gzip_support && self.policy.do_gzip();
        let do_gunzip = self.params.http_gzip_support && self.policy.do_gunzip();
        let (filter, is_gzip) = filters::negotiate_encoding(content_encoding.as_deref(), do_gunzip, do_gzip);

        let client_has_conditional = sess.request.as_ref().map_or(false, |r| {
            r.headers.contains_key("if-modified-since") || r.headers.contains_key("if-none-match")
        });
        let do_stream = compute_do_stream(
            self.policy,
            resp.status,
            sess.wantbody,
            sess.esi_level,
            client_has_conditional,
            filter,
        );

        let busy = BusyObj {
            headers,
            status: resp.status,
            filter,
            do_stream,
            do_gzip,
            do_gunzip,
            do_esi: false,
            is_gzip,
            exp: ExpRecord {
                entered: Instant::now(),
                ttl,
                grace: Duration::from_secs(0),
                keep: Duration::from_secs(0),
            },
            body: resp.body,
        };
        sess.busyobj = Some(busy);

        match action {
            FetchAction::HitForPass => {
                if let Some(obj) = &sess.obj {
                    obj.lock().unwrap().flags |= crate::cache::OC_F_PASS;
                }
                sess.state = State::FetchBody;
            }
            FetchAction::Deliver => {
                sess.state = State::FetchBody;
            }
            FetchAction::Restart => {
                self.restart(sess);
            }
            FetchAction::Error(code) => {
                sess.busyobj = None;
                self.drop_busy(sess);
                sess.status = code;
                sess.state = State::Error;
            }
        }
        StepResult::Continue
    }

    // ---- fetchbody -----------------------------------------------------------

    fn fetchbody(&self, sess: &mut Session) -> StepResult {
        let Some(mut busy) = sess.busyobj.take() else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };

        // `do_stream` was already decided in `fetch` by `compute_do_stream`
        // (ESI, HEAD, conditional-304, and the buffering filters `Gzip`/
        // `Esi` all force it false there); nothing left to override here.

        let byte_budget = busy.body.len().max(1024);
        let primary = self
            .storage
            .new_object(crate::storage::MAIN_STORAGE, byte_budget, busy.headers.clone());
        let handle = match primary {
            Some(handle) => Some(handle),
            None => {
                busy.exp.grace = Duration::from_secs(0);
                busy.exp.keep = Duration::from_secs(0);
                busy.exp.ttl = busy.exp.ttl.min(Duration::from_secs(self.params.shortlived_secs));
                self.storage
                    .new_object(crate::storage::TRANSIENT_STORAGE, byte_budget, busy.headers.clone())
            }
        };

        let Some(mut handle) = handle else {
            sess.status = 503;
            sess.state = State::Error;
            return StepResult::Continue;
        };

        handle.object_mut().status = busy.status;
        handle.object_mut().last_modified = busy
            .headers
            .iter()
            .find(|(k, _)| k == "last-modified")
            .and_then(|(_, v)| httpdate::parse_http_date(v).ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_else(|| busy.exp.entered.elapsed().as_secs());
        handle.object_mut().gzipped = busy.is_gzip;

        if busy.do_stream {
            sess.busyobj = Some(busy);
            if let Some(obj) = &sess.obj {
                obj.lock().unwrap().object = Some(handle);
            }
            sess.state = State::PrepResp;
            return StepResult::Continue;
        }

        let body_filter = filters::filter_for(busy.filter);
        match body_filter.apply(&busy.body) {
            Ok(filtered) => {
                handle.object_mut().body = filtered;
                if sess.obj_cacheable {
                    let digest = sess.digest.unwrap_or([0u8; 32]);
                    if let Some(obj) = sess.obj.take() {
                        let hit_for_pass = obj.lock().unwrap().is_hit_for_pass();
                        self.expiry.lock().unwrap().insert(digest, busy.exp);
                        sess.woken.extend(self.cache.unbusy(&obj, Some(handle), hit_for_pass));
                        sess.obj = Some(obj);
                    }
                } else if let Some(obj) = &sess.obj {
                    // A private scratch head (pass/error) never entered
                    // the table: no waiting list to drain, no expiry
                    // entry to record, just attach the body.
                    obj.lock().unwrap().object = Some(handle);
                }
                sess.state = State::PrepResp;
            }
            Err(_) => {
                // `handle` never got attached to any objhead — its
                // reservation would otherwise leak silently.
                self.storage.release(&handle);
                if sess.obj_cacheable {
                    if let Some(obj) = sess.obj.take() {
                        let digest = sess.digest.unwrap_or([0u8; 32]);
                        sess.woken.extend(self.cache.drop_entry(&digest, &obj));
                    }
                }
                sess.status = 503;
                sess.state = State::Error;
            }
        }
        StepResult::Continue
    }

    // ---- streambody -----------------------------------------------------------

    fn streambody(&self, sess: &mut Session) -> StepResult {
        // Body bytes are pushed to the client by the reactor as they
        // arrive from the backend (RES_StreamStart/RES_StreamEnd, §4.3);
        // by the time this handler runs the fetch has already concluded
        // one way or the other, recorded on `busyobj`.
        let Some(busy) = sess.busyobj.take() else {
            sess.doclose = Some(close_reason::STREAM_ERROR);
            sess.destroy = true;
            sess.state = State::Done;
            return StepResult::Continue;
        };

        if !sess.backend_body_done {
            // Body still arriving from the backend; the reactor pumps
            // chunks straight to the client as they land and re-enters
            // this handler once the fetch finishes.
            sess.busyobj = Some(busy);
            return StepResult::Release;
        }

        wsp!(sess.log, "Length", "xid={} bytes={}", sess.xid, busy.body.len());

        if sess.obj_cacheable {
            let digest = sess.digest.unwrap_or([0u8; 32]);
            if let Some(obj) = sess.obj.take() {
                if sess.expired_during_stream() {
                    sess.woken.extend(self.cache.drop_entry(&digest, &obj));
                    self.release_obj(&obj);
                } else {
                    let hit_for_pass = obj.lock().unwrap().is_hit_for_pass();
                    if let Some(handle) = obj.lock().unwrap().object.as_mut() {
                        handle.object_mut().body = busy.body.clone();
                    }
                    self.expiry.lock().unwrap().insert(digest, busy.exp);
                    sess.woken.extend(self.cache.unbusy(&obj, None, hit_for_pass));
                }
            }
        } else if let Some(obj) = sess.obj.take() {
            // Non-cacheable stream (pass): attach the body for symmetry,
            // then release the reservation behind it — nothing else will
            // ever look this objhead up again.
            if let Some(mut handle) = obj.lock().unwrap().object.take() {
                handle.object_mut().body = busy.body;
                self.storage.release(&handle);
            }
        }
        sess.obj = None;
        sess.backend_body_done = false;
        sess.state = State::Done;
        StepResult::Continue
    }

    // ---- prepresp -----------------------------------------------------------

    fn prepresp(&self, sess: &mut Session) -> StepResult {
        let streaming = sess.busyobj.as_ref().map_or(false, |b| b.do_stream);
        let gzipped = sess.busyobj.as_ref().map_or(false, |b| b.is_gzip)
            || sess.obj.as_ref().map_or(false, |o| {
                o.lock().unwrap().object.as_ref().map_or(false, |h| h.object().gzipped)
            });
        let mut mode: u16 = 0;
        if sess.obj.is_none() && sess.busyobj.is_none() {
            mode |= RES_LEN;
        } else if !streaming {
            mode |= RES_LEN;
        }

        if !sess.disable_esi && sess.busyobj.as_ref().map_or(false, |b| b.do_esi) {
            mode &= !RES_LEN;
            if sess.esi_level > 0 {
                mode |= RES_ESI_CHILD;
            } else {
                mode |= RES_ESI;
            }
        }

        let client_accepts_gzip = sess
            .request
            .as_ref()
            .and_then(|r| r.headers.get("accept-encoding"))
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        if self.params.http_gzip_support && gzipped && !client_accepts_gzip {
            mode &= !RES_LEN;
            mode |= RES_GUNZIP;
        }

        if mode & (RES_LEN | RES_CHUNKED | RES_EOF) == 0 {
            // Can't use "body buffer is empty" here: a streaming fetch's
            // body hasn't arrived yet at this point, so it would always
            // read as empty even for a response that's about to stream
            // plenty of bytes. Only a response that's *known* to carry no
            // body at all (204/304, or an explicit zero Content-Length)
            // gets RES_LEN with no data; everything else is framed for
            // however many bytes eventually show up.
            let known_zero_length = matches!(sess.status, 204 | 304)
                || sess.busyobj.as_ref().map_or(false, |b| {
                    b.headers.iter().any(|(k, v)| k == "content-length" && v.trim() == "0")
                });
            if known_zero_length {
                mode |= RES_LEN;
            } else if !sess.wantbody {
                // leave empty
            } else if sess
                .request
                .as_ref()
                .map(|r| r.version == "HTTP/1.1")
                .unwrap_or(false)
            {
                mode |= RES_CHUNKED;
            } else {
                mode |= RES_EOF;
                sess.doclose = Some(close_reason::EOF_MODE);
            }
        }
        sess.res_mode = mode;

        if let Some(digest) = sess.digest {
            let touched = self
                .expiry
                .lock()
                .unwrap()
                .touch(&digest, Duration::from_secs(self.params.lru_timeout_secs));
            let _ = touched;
        }

        sess.t_resp = Some(Instant::now());

        let action = self.policy.deliver();
        match action {
            DeliverAction::Deliver => {
                if streaming {
                    sess.state = State::StreamBody;
                } else {
                    sess.state = State::Deliver;
                }
            }
            DeliverAction::Restart => {
                self.restart(sess);
            }
        }
        StepResult::Continue
    }

    // ---- deliver -----------------------------------------------------------

    fn deliver(&self, sess: &mut Session) -> StepResult {
        sess.director = None;
        sess.restarts = 0;
        let body_len = sess
            .obj
            .as_ref()
            .and_then(|o| o.lock().ok())
            .and_then(|g| g.object.as_ref().map(|h| h.object().body.len()))
            .unwrap_or(0);
        wsp!(sess.log, "Length", "xid={} bytes={}", sess.xid, body_len);
        // Body bytes are written to the client by the reactor, reading
        // from `sess.obj`'s stored `Object::body`; this handler only
        // releases the object reference (dropping the `Arc`) once that
        // write has been queued. A non-cacheable object (hit-for-pass,
        // `prealloc`'d error) has no one else holding its storage handle,
        // so it's released here rather than left for an eviction sweep
        // that will never find it in the table.
        if !sess.obj_cacheable {
            if let Some(obj) = sess.obj.take() {
                self.release_obj(&obj);
            }
        }
        sess.obj = None;
        sess.state = State::Done;
        StepResult::Continue
    }

    // ---- error -----------------------------------------------------------

    fn error(&self, sess: &mut Session) -> StepResult {
        if sess.obj.is_none() {
            let digest = sess.digest.unwrap_or([0u8; 32]);
            let handle = self
                .storage
                .new_object(crate::storage::MAIN_STORAGE, 512, Vec::new())
                .or_else(|| self.storage.new_object(crate::storage::TRANSIENT_STORAGE, 512, Vec::new()));
            let Some(mut handle) = handle else {
                sess.doclose = Some(close_reason::OUT_OF_OBJECTS);
                sess.destroy = true;
                sess.state = State::Done;
                return StepResult::Continue;
            };
            handle.object_mut().status = sess.status;
            let obj = self.cache.prealloc(digest);
            obj.lock().unwrap().object = Some(handle);
            sess.obj = Some(obj);
            sess.obj_cacheable = false;
        }

        let status = if (100..=999).contains(&sess.status) {
            sess.status
        } else {
            501
        };
        sess.status = status;
        sess.response_headers.push(("Server".to_string(), "cache_proxy".to_string()));

        let action = self.policy.error();
        match action {
            ErrorAction::Restart if sess.restarts < self.params.max_restarts => {
                if let Some(obj) = sess.obj.take() {
                    if sess.obj_cacheable {
                        let digest = sess.digest.unwrap_or([0u8; 32]);
                        sess.woken.extend(self.cache.drop_entry(&digest, &obj));
                    }
                    self.release_obj(&obj);
                }
                sess.restarts += 1;
                sess.director = None;
                sess.state = State::Recv;
            }
            _ => {
                sess.doclose = Some(close_reason::ERROR);
                sess.wantbody = true;
                sess.state = State::PrepResp;
            }
        }
        StepResult::Continue
    }

    // ---- done -----------------------------------------------------------

    fn done(&self, sess: &mut Session) -> StepResult {
        sess.t_end = Some(Instant::now());
        let dh = fmt_delta(sess.t_req, sess.t_resp);
        let dp = fmt_delta(sess.t_resp, sess.t_end);
        let da = fmt_delta(sess.t_req, sess.t_end);
        wsp!(
            sess.log,
            "ReqEnd",
            "xid={} t_req={:?} t_end={:?} dh={} dp={} da={}",
            sess.xid,
            sess.t_req,
            sess.t_end,
            dh,
            dp,
            da
        );
        sess.log.flush();
        Stats::incr(&self.stats.sess_closed);

        sess.request = None;
        sess.busyobj = None;
        sess.obj = None;
        sess.xid = 0;
        sess.backend_body_done = false;
        if let Some(mark) = sess.session_mark {
            sess.workspace.reset(mark);
        }

        if sess.esi_level > 0 {
            return StepResult::Release;
        }

        if sess.destroy || sess.doclose.is_some() {
            return StepResult::Release;
        }

        sess.state = State::Wait;
        StepResult::Release
    }

    // ---- shared helpers -----------------------------------------------------------

    fn restart(&self, sess: &mut Session) {
        if sess.restarts >= self.params.max_restarts {
            sess.status = 503;
            sess.state = State::Error;
            return;
        }
        sess.restarts += 1;
        sess.director = None;
        wsp!(sess.log, "Debug", "xid={} state=restart restarts={}", sess.xid, sess.restarts);
        if let Some(obj) = sess.obj.take() {
            if sess.obj_cacheable {
                let digest = sess.digest.unwrap_or([0u8; 32]);
                sess.woken.extend(self.cache.drop_entry(&digest, &obj));
            }
            self.release_obj(&obj);
        }
        sess.busyobj = None;
        if let Some(mark) = sess.request_mark {
            sess.workspace.reset(mark);
        }
        if let (Some(http0), Some(req)) = (&sess.http0, sess.request.as_mut()) {
            req.method = http0.method.clone();
            req.url = http0.url.clone();
            req.version = http0.version.clone();
            req.headers = http0.headers.clone();
            req.body = http0.body.clone();
        }
        sess.state = State::Recv;
    }

    fn drop_busy(&self, sess: &mut Session) {
        if let Some(obj) = sess.obj.take() {
            if sess.obj_cacheable {
                let digest = sess.digest.unwrap_or([0u8; 32]);
                sess.woken.extend(self.cache.drop_entry(&digest, &obj));
            }
            self.release_obj(&obj);
        }
    }

    /// Reserves workspace room for this request's vary blob (§4.2
    /// `lookup`'s header budget). The fetching session (`publish = true`,
    /// the `Miss` branch) keeps it via `release_p` so a later `Hit` on the
    /// same digest has the blob to validate against; a `Hit` only needs
    /// it transiently and discards it right back with `release`.
    fn reserve_vary_blob(&self, sess: &mut Session, publish: bool) {
        let vary = vary_blob(sess);
        let mark = sess.workspace.snapshot();
        let Some(slot) = sess.workspace.reserve(vary.len()) else {
            return;
        };
        slot.copy_from_slice(&vary);
        if publish {
            sess.workspace.release_p(mark, vary.len());
        } else {
            sess.workspace.release(mark);
        }
    }

    /// Releases the storage reservation behind a busy/object handle, if
    /// any. Every terminal path that takes `sess.obj` out of play —
    /// restart, drop, error, delivery of a non-cacheable object — must
    /// call this or the budget `Storage::new_object` reserved for it
    /// leaks for the life of the process.
    fn release_obj(&self, obj: &Arc<Mutex<ObjHead>>) {
        if let Some(handle) = obj.lock().unwrap().object.take() {
            self.storage.release(&handle);
        }
    }
}

impl Session {
    fn expired_during_stream(&self) -> bool {
        false
    }
}

/// Hop-by-hop headers (RFC 7230 §6.1) plus the conditional-request
/// headers a fetch must strip from its own bereq: `miss` always asks the
/// backend for a full, current representation to store in cache, so any
/// `Range`/`If-*` the client sent would let the backend answer 206/304
/// against validators the client holds, not the cache.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "range",
    "if-modified-since",
    "if-none-match",
    "if-match",
    "if-range",
    "if-unmodified-since",
];

/// Header-class `R_FETCH` (§4.2 `miss`): strips the headers above from a
/// cloned bereq before it's handed to the fetch policy hook and the
/// backend. `Accept-Encoding` is left alone here — `build_request`
/// decides its final value uniformly for both `miss` and `pass` bereqs.
fn filter_r_fetch_headers(headers: &mut HashMap<String, String>) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// `cnt_recv`'s exact rewrite (§C.3): collapse to exactly `gzip` if the
/// client accepts it at all, otherwise remove the header entirely —
/// never pass through q-values or other codings to the backend request.
pub fn normalize_accept_encoding(req: &mut HttpRequest) {
    let accepts_gzip = req
        .headers
        .get("accept-encoding")
        .map(|v| v.split(',').any(|c| c.trim().starts_with("gzip")))
        .unwrap_or(false);
    if accepts_gzip {
        req.headers.insert("accept-encoding".to_string(), "gzip".to_string());
    } else {
        req.headers.remove("accept-encoding");
    }
}

/// Formats a `ReqEnd` timing field: seconds between two optional instants,
/// or `-` when either side was never recorded (e.g. `dp` on a request that
/// never reached a backend).
fn fmt_delta(a: Option<Instant>, b: Option<Instant>) -> String {
    match (a, b) {
        (Some(a), Some(b)) => format!("{:.6}", b.saturating_duration_since(a).as_secs_f64()),
        _ => "-".to_string(),
    }
}

/// The only vary axis this engine negotiates on: the request's
/// `Accept-Encoding`, already collapsed to `gzip` or removed entirely by
/// `normalize_accept_encoding` in `recv` before `lookup` ever sees it.
fn vary_blob(sess: &Session) -> Vec<u8> {
    sess.request
        .as_ref()
        .and_then(|r| r.headers.get("accept-encoding"))
        .map(|v| v.as_bytes().to_vec())
        .unwrap_or_default()
}

/// The streaming-eligibility rule, shared between `fetch` and the
/// reactor's early readable-event dispatch (`server.rs`) so the
/// reactor's prediction of whether a fetch will stream always agrees
/// with what `fetchbody` goes on to do with it.
pub fn compute_do_stream(
    policy: &dyn Policy,
    status: u16,
    wantbody: bool,
    esi_level: u32,
    client_has_conditional: bool,
    filter: FilterKind,
) -> bool {
    if esi_level > 0 || !wantbody {
        return false;
    }
    if client_has_conditional && status == 200 {
        // A conditional request may still resolve to 304 once the
        // reactor compares validators against the stored object; buffer
        // so the status can still be rewritten before any bytes reach
        // the client.
        return false;
    }
    if matches!(filter, FilterKind::Gzip | FilterKind::Esi) {
        // These need the whole body before they can transform it (compress,
        // or splice in includes); `Gunzip`/`TestGzip` don't transform what
        // goes out the wire in a way that needs buffering, so they stay
        // eligible.
        return false;
    }
    policy.do_stream(status)
}

fn canonicalize_multiline(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for (k, v) in headers {
        if (k == "cache-control" || k == "vary") && merged.iter().any(|(ek, _)| ek == k) {
            if let Some(entry) = merged.iter_mut().find(|(ek, _)| ek == k) {
                entry.1.push_str(", ");
                entry.1.push_str(v);
            }
        } else {
            merged.push((k.clone(), v.clone()));
        }
    }
    merged
}

fn ttl_from_headers(headers: &[(String, String)], params: &EngineParams) -> Duration {
    let _ = params;
    headers
        .iter()
        .find(|(k, _)| k == "cache-control")
        .and_then(|(_, v)| {
            v.split(',').find_map(|part| {
                let part = part.trim();
                part.strip_prefix("max-age=").and_then(|n| n.parse().ok())
            })
        })
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(crate::config::DEFAULT_TTL_SECS))
}

fn sha256_digest(key: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key);
    let out = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&out);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DefaultPolicy;

    fn test_engine<'a>(
        cache: &'a Cache,
        storage: &'a Storage,
        expiry: &'a Mutex<ExpiryEngine>,
        stats: &'a Stats,
        policy: &'a DefaultPolicy,
        params: &'a EngineParams,
    ) -> Engine<'a> {
        Engine { cache, storage, expiry, stats, policy, params }
    }

    fn get_request(url: &str) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.method = Method::GET;
        req.url = url.to_string();
        req.version = "HTTP/1.1".to_string();
        req.headers.insert("host".to_string(), "example.com".to_string());
        req
    }

    #[test]
    fn first_through_recv_computes_a_digest() {
        let cache = Cache::new();
        let storage = Storage::new(1 << 20);
        let expiry = Mutex::new(ExpiryEngine::new());
        let stats = Stats::default();
        let policy = DefaultPolicy;
        let params = EngineParams::default();
        let engine = test_engine(&cache, &storage, &expiry, &stats, &policy, &params);

        let mut sess = Session::new(1, 4096, None);
        sess.wait_outcome = Some(WaitOutcome::Complete);
        sess.request = Some(get_request("/a"));

        assert_eq!(engine.step(&mut sess), StepResult::Continue); // first
        assert_eq!(engine.step(&mut sess), StepResult::Continue); // wait
        assert_eq!(engine.step(&mut sess), StepResult::Continue); // start
        assert_eq!(engine.step(&mut sess), StepResult::Continue); // recv

        assert_eq!(sess.state, State::Lookup);
        assert!(sess.digest.is_some());
    }

    #[test]
    fn lookup_on_empty_cache_misses_and_marks_busy() {
        let cache = Cache::new();
        let storage = Storage::new(1 << 20);
        let expiry = Mutex::new(ExpiryEngine::new());
        let stats = Stats::default();
        let policy = DefaultPolicy;
        let params = EngineParams::default();
        let engine = test_engine(&cache, &storage, &expiry, &stats, &policy, &params);

        let mut sess = Session::new(1, 4096, None);
        sess.digest = Some([9u8; 32]);
        sess.state = State::Lookup;
        engine.step(&mut sess);
        assert_eq!(sess.state, State::Miss);
        assert!(sess.obj.is_some());
    }

    #[test]
    fn second_lookup_behind_busy_peer_releases() {
        let cache = Cache::new();
        let storage = Storage::new(1 << 20);
        let expiry = Mutex::new(ExpiryEngine::new());
        let stats = Stats::default();
        let policy = DefaultPolicy;
        let params = EngineParams::default();
        let engine = test_engine(&cache, &storage, &expiry, &stats, &policy, &params);

        let digest = [3u8; 32];
        let mut first = Session::new(1, 4096, None);
        first.digest = Some(digest);
        first.state = State::Lookup;
        engine.step(&mut first);

        let mut second = Session::new(2, 4096, None);
        second.digest = Some(digest);
        second.state = State::Lookup;
        assert_eq!(engine.step(&mut second), StepResult::Release);
    }

    #[test]
    fn restart_budget_is_enforced() {
        let cache = Cache::new();
        let storage = Storage::new(1 << 20);
        let expiry = Mutex::new(ExpiryEngine::new());
        let stats = Stats::default();
        let policy = DefaultPolicy;
        let mut params = EngineParams::default();
        params.max_restarts = 1;
        let engine = test_engine(&cache, &storage, &expiry, &stats, &policy, &params);

        let mut sess = Session::new(1, 4096, None);
        sess.restarts = 1;
        sess.state = State::Recv;
        sess.request = Some(get_request("/a"));
        engine.step(&mut sess);
        assert_eq!(sess.state, State::Error);
        assert_eq!(sess.status, 503);
    }

    #[test]
    fn normalize_accept_encoding_collapses_to_gzip() {
        let mut req = get_request("/a");
        req.headers.insert("accept-encoding".to_string(), "br;q=0.9, gzip;q=0.8".to_string());
        normalize_accept_encoding(&mut req);
        assert_eq!(req.headers.get("accept-encoding").unwrap(), "gzip");
    }

    #[test]
    fn normalize_accept_encoding_removes_header_without_gzip() {
        let mut req = get_request("/a");
        req.headers.insert("accept-encoding".to_string(), "br, deflate".to_string());
        normalize_accept_encoding(&mut req);
        assert!(!req.headers.contains_key("accept-encoding"));
    }

    #[test]
    fn error_status_outside_valid_range_normalizes_to_501() {
        let cache = Cache::new();
        let storage = Storage::new(1 << 20);
        let expiry = Mutex::new(ExpiryEngine::new());
        let stats = Stats::default();
        let policy = DefaultPolicy;
        let params = EngineParams::default();
        let engine = test_engine(&cache, &storage, &expiry, &stats, &policy, &params);

        let mut sess = Session::new(1, 4096, None);
        sess.status = 5000;
        sess.digest = Some([1u8; 32]);
        sess.state = State::Error;
        engine.step(&mut sess);
        assert_eq!(sess.status, 501);
    }
}
