//! Small glob-import convenience module, the way the teacher's own
//! `prelude` collects the names its `http`/parsing code reaches for on
//! every file. Kept deliberately narrow: only the config/error/http
//! surface plus the handful of status-code constants `http/request.rs`
//! needs to map a parse failure onto a status.

pub use crate::config::{AppConfig, RouteConfig, ServerConfig};
pub use crate::error::Result;
pub use crate::http::*;

pub use std::collections::HashMap;
pub use std::fmt::{self, Display};
pub use std::str::FromStr;

// 4xx the parser can produce directly from a malformed request.
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_URI_TOO_LONG: u16 = 414;
