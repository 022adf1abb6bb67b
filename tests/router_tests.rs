use cache_proxy::config::{RouteConfig, ServerConfig};
use cache_proxy::http::Method;
use cache_proxy::router::{find_route, RoutingError};

fn route(path: &str, methods: &[&str]) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    }
}

fn server_with_routes(routes: Vec<RouteConfig>) -> ServerConfig {
    ServerConfig {
        routes,
        ..Default::default()
    }
}

#[test]
fn matches_exact_path() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let found = find_route(&cfg, "/", &Method::GET).unwrap();
    assert_eq!(found.path, "/");
}

#[test]
fn falls_back_to_root_prefix_for_unconfigured_path() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let found = find_route(&cfg, "/unconfigured", &Method::GET).unwrap();
    assert_eq!(found.path, "/");
}

#[test]
fn picks_longest_matching_prefix() {
    let cfg = server_with_routes(vec![route("/a", &["GET"]), route("/a/b", &["GET"])]);
    let found = find_route(&cfg, "/a/b/c", &Method::GET).unwrap();
    assert_eq!(found.path, "/a/b");
}

#[test]
fn method_not_in_route_is_rejected() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let err = find_route(&cfg, "/", &Method::POST).unwrap_err();
    assert!(matches!(err, RoutingError::MethodNotAllowed));
}

#[test]
fn path_outside_every_prefix_is_not_found() {
    let cfg = server_with_routes(vec![route("/a", &["GET"])]);
    let err = find_route(&cfg, "/b", &Method::GET).unwrap_err();
    assert!(matches!(err, RoutingError::NotFound));
}

#[test]
fn no_routes_configured_is_not_found() {
    let cfg = server_with_routes(vec![]);
    let err = find_route(&cfg, "/", &Method::GET).unwrap_err();
    assert!(matches!(err, RoutingError::NotFound));
}
