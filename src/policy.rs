//! VCL-style policy hooks. One trait method per hook named in spec §6;
//! `DefaultPolicy` gives the stock behavior each state handler falls back
//! to when no custom policy overrides it — the same relationship a VCL
//! file has to Varnish's builtin.vcl.

use crate::http::HttpRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvAction {
    Lookup,
    Pass,
    Pipe,
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitAction {
    Deliver,
    Pass,
    Error(u16),
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissAction {
    Fetch,
    Pass,
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassAction {
    Pass,
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeAction {
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    HitForPass,
    Deliver,
    Restart,
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverAction {
    Deliver,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Deliver,
    Restart,
}

/// One hook per §6 `Policy hooks` line. A request never reaches a hook
/// this trait doesn't define; hooks this spec doesn't need (`hash` has no
/// branch of its own — it always returns `hash`) aren't modeled as a
/// method, matching §4.2 recv's note that `hash` "must return hash".
pub trait Policy: Send + Sync {
    fn recv(&self, req: &HttpRequest) -> RecvAction {
        let _ = req;
        RecvAction::Lookup
    }

    fn hit(&self, req: &HttpRequest) -> HitAction {
        let _ = req;
        HitAction::Deliver
    }

    fn miss(&self, req: &HttpRequest) -> MissAction {
        let _ = req;
        MissAction::Fetch
    }

    fn pass(&self, req: &HttpRequest) -> PassAction {
        let _ = req;
        PassAction::Pass
    }

    fn pipe(&self, req: &HttpRequest) -> PipeAction {
        let _ = req;
        PipeAction::Pipe
    }

    fn fetch(&self, status: u16) -> FetchAction {
        if status >= 500 {
            FetchAction::Error(503)
        } else {
            FetchAction::Deliver
        }
    }

    fn deliver(&self) -> DeliverAction {
        DeliverAction::Deliver
    }

    fn error(&self) -> ErrorAction {
        ErrorAction::Deliver
    }

    /// Whether a `deliver`-bound fetch of this status may stream straight
    /// through to the client instead of buffering first. Admin-level, like
    /// `do_gzip`/`do_gunzip` below — never derived from the current
    /// request's headers. `fetchbody` still forces this false when ESI,
    /// a HEAD request, or on-the-fly gzip compression rules it out.
    fn do_stream(&self, status: u16) -> bool {
        let _ = status;
        true
    }

    /// Whether `fetchbody` should gzip-compress a plain backend response
    /// before storing it. An admin/site-wide setting (a real deployment's
    /// VCL would gate this on content type, size, or backend), not a
    /// per-request echo of the client's `Accept-Encoding`.
    fn do_gzip(&self) -> bool {
        false
    }

    /// Whether `fetchbody` should store a gzip backend response decoded to
    /// plain instead of keeping it compressed. Same admin-level contract
    /// as `do_gzip`.
    fn do_gunzip(&self) -> bool {
        false
    }

    /// Key material the `hash` hook feeds into the session's SHA-256
    /// context. Default: `Host` header plus URL, the textbook VCL default.
    fn hash_key(&self, req: &HttpRequest) -> Vec<u8> {
        let mut key = Vec::new();
        if let Some(host) = req.headers.get("host") {
            key.extend_from_slice(host.as_bytes());
        }
        key.push(0);
        key.extend_from_slice(req.url.as_bytes());
        key
    }
}

/// The stock policy: lookup on GET/HEAD, pass everything else, never pipe,
/// never restart. A deployment replaces this with its own `Policy` impl
/// the way a site replaces Varnish's `builtin.vcl`.
#[derive(Debug, Default)]
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {
    fn recv(&self, req: &HttpRequest) -> RecvAction {
        use crate::http::Method;
        match req.method {
            Method::GET | Method::HEAD | Method::DELETE => RecvAction::Lookup,
            Method::POST => RecvAction::Pass,
        }
    }
}
