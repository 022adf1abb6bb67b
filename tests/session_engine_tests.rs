//! End-to-end exercises of the session state machine, driven directly
//! through `Engine::step` rather than over a socket (`server_chunked.rs`
//! covers the reactor wiring). Each test plays out one of the six
//! transition traces: a buffered miss, a streaming miss that gunzips on
//! the way out, a session parked behind a busy peer, a hit-for-pass
//! entry, a restart from `deliver`, and a HEAD against a gzip-stored
//! object.

use cache_proxy::cache::{Cache, LookupResult, ParkedSession};
use cache_proxy::config::EngineParams;
use cache_proxy::expiry::ExpiryEngine;
use cache_proxy::http::{self, HttpRequest, Method};
use cache_proxy::policy::{DeliverAction, Policy};
use cache_proxy::session::response_mode::{RES_CHUNKED, RES_GUNZIP, RES_LEN};
use cache_proxy::session::{BackendResponse, Engine, Session, State, StepResult, WaitOutcome};
use cache_proxy::stats::Stats;
use cache_proxy::storage::{Storage, MAIN_STORAGE};
use std::sync::Mutex;

/// Admin-level knobs a real deployment would set in VCL — never derived
/// from the request under test, matching `do_stream`/`do_gzip`/`do_gunzip`'s
/// contract.
struct ScenarioPolicy {
    do_stream: bool,
    do_gzip: bool,
    do_gunzip: bool,
    restart_on_deliver: bool,
}

impl Default for ScenarioPolicy {
    fn default() -> Self {
        Self {
            do_stream: false,
            do_gzip: false,
            do_gunzip: false,
            restart_on_deliver: false,
        }
    }
}

impl Policy for ScenarioPolicy {
    fn do_stream(&self, _status: u16) -> bool {
        self.do_stream
    }

    fn do_gzip(&self) -> bool {
        self.do_gzip
    }

    fn do_gunzip(&self) -> bool {
        self.do_gunzip
    }

    fn deliver(&self) -> DeliverAction {
        if self.restart_on_deliver {
            DeliverAction::Restart
        } else {
            DeliverAction::Deliver
        }
    }
}

fn request(method: Method, url: &str) -> HttpRequest {
    let mut req = HttpRequest::new();
    req.method = method;
    req.url = url.to_string();
    req.version = "HTTP/1.1".to_string();
    req.headers.insert("host".to_string(), "example.com".to_string());
    req
}

/// A body that passes `TestGzip`'s magic-byte check, long enough to stand
/// in for the scenario's "1000 bytes" backend body.
fn gzip_like_body(len: usize) -> Vec<u8> {
    let mut body = vec![0x42u8; len];
    body[0] = 0x1f;
    body[1] = 0x8b;
    body
}

fn gzip_backend_response(body: Vec<u8>) -> BackendResponse {
    BackendResponse {
        status: 200,
        headers: vec![
            ("content-encoding".to_string(), "gzip".to_string()),
            ("content-length".to_string(), body.len().to_string()),
            ("cache-control".to_string(), "max-age=60".to_string()),
        ],
        body,
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: false,
    }
}

struct Harness {
    cache: Cache,
    storage: Storage,
    expiry: Mutex<ExpiryEngine>,
    stats: Stats,
}

impl Harness {
    fn new() -> Self {
        Self {
            cache: Cache::new(),
            storage: Storage::new(1 << 20),
            expiry: Mutex::new(ExpiryEngine::new()),
            stats: Stats::default(),
        }
    }

    fn engine<'a>(&'a self, policy: &'a ScenarioPolicy, params: &'a EngineParams) -> Engine<'a> {
        Engine {
            cache: &self.cache,
            storage: &self.storage,
            expiry: &self.expiry,
            stats: &self.stats,
            policy,
            params,
        }
    }
}

/// Scenario 1: cache miss, buffered fetch, gzip stored. The client wants
/// gzip too, so nothing needs decoding and the whole thing buffers.
#[test]
fn buffered_miss_stores_gzip_body_and_delivers_without_streaming() {
    let harness = Harness::new();
    let policy = ScenarioPolicy::default(); // do_stream = false: admin buffers this response
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);

    let mut sess = Session::new(1, 4096, None);
    sess.wait_outcome = Some(WaitOutcome::Complete);
    let mut req = request(Method::GET, "/a");
    req.headers.insert("accept-encoding".to_string(), "gzip".to_string());
    sess.request = Some(req);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // first
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // wait
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // start
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // recv
    assert_eq!(sess.state, State::Lookup);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // lookup -> miss
    assert_eq!(sess.state, State::Miss);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // miss -> fetch
    assert_eq!(sess.state, State::Fetch);

    assert_eq!(engine.step(&mut sess), StepResult::Release); // fetch waits on backend
    let body = gzip_like_body(1000);
    sess.backend_response = Some(gzip_backend_response(body.clone()));
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetch -> fetchbody
    assert_eq!(sess.state, State::FetchBody);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetchbody -> prepresp
    assert_eq!(sess.state, State::PrepResp);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // prepresp -> deliver
    assert_eq!(sess.state, State::Deliver);
    assert_eq!(sess.res_mode & RES_LEN, RES_LEN);
    assert_eq!(sess.res_mode & RES_GUNZIP, 0);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // deliver -> done
    assert_eq!(sess.state, State::Done);

    assert_eq!(engine.step(&mut sess), StepResult::Release); // done -> wait (recycled)
    assert_eq!(sess.state, State::Wait);

    let digest = sess.digest.expect("digest survives recycling for this test's purposes");
    match harness.cache.lookup(digest, false) {
        LookupResult::Hit(head) => {
            let guard = head.lock().unwrap();
            let handle = guard.object.as_ref().expect("fetched body stays attached to the table entry");
            assert!(handle.object().gzipped);
            assert_eq!(handle.object().body, body);
        }
        _ => panic!("expected the fetched object to be cached"),
    }

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.cache_miss, 1);
    assert_eq!(snapshot.backend_fetch, 1);
}

/// Scenario 2: cache miss, streaming, client wants plain. `RES_GUNZIP` is
/// set and the trace runs through `streambody` instead of `deliver`
/// directly, even though the negotiated filter is `TestGzip` rather than
/// `Passthrough`.
#[test]
fn streaming_miss_sets_res_gunzip_and_uses_streambody() {
    let harness = Harness::new();
    let policy = ScenarioPolicy {
        do_stream: true,
        ..Default::default()
    };
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);

    let mut sess = Session::new(2, 4096, None);
    sess.wait_outcome = Some(WaitOutcome::Complete);
    sess.request = Some(request(Method::GET, "/a")); // no Accept-Encoding

    for _ in 0..4 {
        assert_eq!(engine.step(&mut sess), StepResult::Continue); // first, wait, start, recv
    }
    assert_eq!(sess.state, State::Lookup);
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // miss
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetch
    assert_eq!(engine.step(&mut sess), StepResult::Release); // waits on backend

    let body = gzip_like_body(1000);
    sess.backend_response = Some(gzip_backend_response(body.clone()));
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetch -> fetchbody
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetchbody -> prepresp
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // prepresp -> streambody
    assert_eq!(sess.state, State::StreamBody);
    assert_eq!(sess.res_mode & RES_GUNZIP, RES_GUNZIP);
    assert_eq!(sess.res_mode & RES_CHUNKED, RES_CHUNKED);
    assert_eq!(sess.res_mode & RES_LEN, 0);

    // The reactor hasn't finished pumping the backend body yet.
    assert_eq!(engine.step(&mut sess), StepResult::Release);
    assert_eq!(sess.state, State::StreamBody);

    sess.backend_body_done = true;
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // streambody -> done
    assert_eq!(sess.state, State::Done);

    let digest = sess.digest.unwrap();
    match harness.cache.lookup(digest, false) {
        LookupResult::Hit(head) => {
            let guard = head.lock().unwrap();
            let handle = guard.object.as_ref().unwrap();
            assert!(handle.object().gzipped, "object is still stored gzip-encoded");
            assert_eq!(handle.object().body, body, "cache keeps the raw bytes off the wire");
        }
        _ => panic!("expected the streamed object to be cached"),
    }
}

/// Scenario 3: a session parked behind a busy peer is woken once the
/// fetching session finishes, whether that finish is a success (hit the
/// object the first session built) or a failure (falls through to miss).
#[test]
fn busy_peer_is_woken_on_fetch_success() {
    let harness = Harness::new();
    let policy = ScenarioPolicy::default();
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);
    let digest = [7u8; 32];

    let mut a = Session::new(10, 4096, None);
    a.digest = Some(digest);
    a.state = State::Lookup;
    a.request = Some(request(Method::GET, "/k"));
    assert_eq!(engine.step(&mut a), StepResult::Continue);
    assert_eq!(a.state, State::Miss);

    let mut b = Session::new(11, 4096, None);
    b.digest = Some(digest);
    b.state = State::Lookup;
    assert_eq!(engine.step(&mut b), StepResult::Release);
    assert_eq!(b.state, State::Lookup, "still parked behind A, nothing to transition to yet");

    let head = harness.cache.deref(&digest).expect("A's miss created the table entry");
    head.lock().unwrap().park(ParkedSession { worker: 0, token: 99 });

    assert_eq!(engine.step(&mut a), StepResult::Continue); // miss -> fetch
    assert_eq!(engine.step(&mut a), StepResult::Release); // waiting on backend
    a.backend_response = Some(BackendResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: b"hi".to_vec(),
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: false,
    });
    assert_eq!(engine.step(&mut a), StepResult::Continue); // fetch -> fetchbody
    assert_eq!(engine.step(&mut a), StepResult::Continue); // fetchbody succeeds, unbusy

    assert_eq!(a.woken, vec![ParkedSession { worker: 0, token: 99 }]);

    b.state = State::Lookup;
    assert_eq!(engine.step(&mut b), StepResult::Continue); // re-dispatched, now a Hit
    assert_eq!(b.state, State::Hit);
}

#[test]
fn busy_peer_falls_through_to_miss_on_fetch_failure() {
    let harness = Harness::new();
    let policy = ScenarioPolicy::default();
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);
    let digest = [8u8; 32];

    let mut a = Session::new(12, 4096, None);
    a.digest = Some(digest);
    a.state = State::Lookup;
    a.request = Some(request(Method::GET, "/k"));
    assert_eq!(engine.step(&mut a), StepResult::Continue);

    let mut b = Session::new(13, 4096, None);
    b.digest = Some(digest);
    b.state = State::Lookup;
    assert_eq!(engine.step(&mut b), StepResult::Release);

    let head = harness.cache.deref(&digest).unwrap();
    head.lock().unwrap().park(ParkedSession { worker: 1, token: 5 });

    assert_eq!(engine.step(&mut a), StepResult::Continue); // miss -> fetch
    assert_eq!(engine.step(&mut a), StepResult::Release);
    a.backend_response = Some(BackendResponse {
        status: 0,
        headers: Vec::new(),
        body: Vec::new(),
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: true,
    });
    // The failure branch drops the busy entry and wakes B in the same
    // step that notices the backend failed, before ever reaching `error`.
    assert_eq!(engine.step(&mut a), StepResult::Continue);
    assert_eq!(a.state, State::Error);
    assert_eq!(a.woken, vec![ParkedSession { worker: 1, token: 5 }]);
    assert!(harness.cache.deref(&digest).is_none(), "failed fetch removes the table entry");

    b.state = State::Lookup;
    assert_eq!(engine.step(&mut b), StepResult::Continue); // nothing there anymore
    assert_eq!(b.state, State::Miss);
}

/// Scenario 4: a hit-for-pass entry short-circuits straight to `pass`
/// instead of `hit`, and counts against `cache_hitpass`.
#[test]
fn hit_for_pass_entry_routes_through_pass() {
    let harness = Harness::new();
    let policy = ScenarioPolicy::default();
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);
    let digest = [4u8; 32];

    // Seed a hit-for-pass entry, as an earlier uncacheable fetch would.
    let head = match harness.cache.lookup(digest, false) {
        LookupResult::Miss(head) => head,
        _ => unreachable!(),
    };
    let handle = harness.storage.new_object(MAIN_STORAGE, 64, Vec::new()).unwrap();
    head.lock().unwrap().object = Some(handle);
    harness.cache.unbusy(&head, None, true);

    let mut sess = Session::new(20, 4096, None);
    sess.digest = Some(digest);
    sess.state = State::Lookup;
    sess.request = Some(request(Method::GET, "/k"));

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // lookup -> pass
    assert_eq!(sess.state, State::Pass);
    assert_eq!(harness.stats.snapshot().cache_hitpass, 1);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // pass -> fetch
    assert_eq!(sess.state, State::Fetch);

    assert_eq!(engine.step(&mut sess), StepResult::Release);
    sess.backend_response = Some(BackendResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: b"fresh".to_vec(),
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: false,
    });
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetch -> fetchbody
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetchbody -> prepresp
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // prepresp -> deliver
    assert_eq!(sess.state, State::Deliver);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // deliver -> done
    assert_eq!(sess.state, State::Done);
}

/// Scenario 5: a restart from `deliver` releases whatever object was in
/// flight, clears `director`, restores the pre-restart request, and sends
/// the session back to `recv`.
#[test]
fn restart_from_deliver_releases_object_and_resets_request() {
    let harness = Harness::new();
    let policy = ScenarioPolicy {
        restart_on_deliver: true,
        ..Default::default()
    };
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);
    let digest = [6u8; 32];

    let mut sess = Session::new(30, 4096, None);
    sess.digest = Some(digest);
    sess.state = State::Lookup;
    let original = request(Method::GET, "/k");
    sess.http0 = Some(cache_proxy::session::RequestSnapshot::from_request(&original));
    sess.request = Some(original);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // lookup -> miss
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // miss -> fetch
    assert_eq!(engine.step(&mut sess), StepResult::Release);
    sess.backend_response = Some(BackendResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: b"payload".to_vec(),
        from_recycled_conn: false,
        retryable_failure: false,
        fatal_failure: false,
    });
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetch -> fetchbody
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // fetchbody -> prepresp

    // A handler downstream of the VCL boundary mutated the request; restart
    // must put it back the way it was before the backend ever saw it.
    sess.request.as_mut().unwrap().headers.insert("x-rewritten".to_string(), "yes".to_string());

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // prepresp: policy restarts
    assert_eq!(sess.state, State::Recv);
    assert_eq!(sess.restarts, 1);
    assert!(sess.director.is_none());
    assert!(sess.obj.is_none());
    assert!(sess.busyobj.is_none());
    assert!(!sess.request.as_ref().unwrap().headers.contains_key("x-rewritten"));
    assert!(harness.cache.deref(&digest).is_none(), "restart drops the in-flight table entry");
}

/// Scenario 6: a HEAD request against a gzip-stored object that the
/// client can also accept gzip for ends at `deliver` with `RES_LEN` and
/// no body bytes, since `wantbody` is false for HEAD.
#[test]
fn head_against_gzip_object_delivers_headers_only() {
    let harness = Harness::new();
    let policy = ScenarioPolicy::default();
    let params = EngineParams::default();
    let engine = harness.engine(&policy, &params);

    let mut sess = Session::new(40, 4096, None);
    let mut req = request(Method::HEAD, "/g");
    req.headers.insert("accept-encoding".to_string(), "gzip".to_string());
    sess.request = Some(req);
    sess.state = State::Recv; // legal re-entry point

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // recv
    assert_eq!(sess.state, State::Lookup);
    assert!(!sess.wantbody, "HEAD never wants a body");
    let digest = sess.digest.expect("recv computed a digest");

    let body = gzip_like_body(20);
    let head = match harness.cache.lookup(digest, false) {
        LookupResult::Miss(head) => head,
        _ => unreachable!(),
    };
    let mut handle = harness.storage.new_object(MAIN_STORAGE, 64, Vec::new()).unwrap();
    handle.object_mut().gzipped = true;
    handle.object_mut().body = body.clone();
    head.lock().unwrap().object = Some(handle);
    harness.cache.unbusy(&head, None, false);

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // lookup -> hit
    assert_eq!(sess.state, State::Hit);
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // hit -> prepresp
    assert_eq!(sess.state, State::PrepResp);
    assert_eq!(engine.step(&mut sess), StepResult::Continue); // prepresp -> deliver
    assert_eq!(sess.state, State::Deliver);
    assert_eq!(sess.res_mode, RES_LEN);

    let response_head = http::build_http(&sess, &body);
    assert_eq!(response_head.headers.get("content-length").map(String::as_str), Some("0"));

    assert_eq!(engine.step(&mut sess), StepResult::Continue); // deliver -> done
    assert_eq!(sess.state, State::Done);
    assert_eq!(harness.stats.snapshot().cache_hit, 1);
}
