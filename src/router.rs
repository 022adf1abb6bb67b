use crate::config::{RouteConfig, ServerConfig};
use crate::http::Method;

#[derive(Debug)]
pub enum RoutingError {
    NotFound,
    MethodNotAllowed,
}

/// Longest-prefix match over a server block's routes, the same job VCL's
/// `recv` hook does with a chain of `if (req.url ~ ...)` tests, collapsed
/// into a table lookup since this port has no VCL compiler.
pub fn find_route<'a>(
    cfg: &'a ServerConfig,
    url: &str,
    method: &Method,
) -> Result<&'a RouteConfig, RoutingError> {
    let mut best: Option<&RouteConfig> = None;
    for route in &cfg.routes {
        if url.starts_with(route.path.as_str()) {
            let better = match best {
                Some(b) => route.path.len() > b.path.len(),
                None => true,
            };
            if better {
                best = Some(route);
            }
        }
    }

    match best {
        Some(route) => {
            if route.methods.iter().any(|m| m == method.as_str()) {
                Ok(route)
            } else {
                Err(RoutingError::MethodNotAllowed)
            }
        }
        None => Err(RoutingError::NotFound),
    }
}
