use cache_proxy::config::{AppConfig, ServerConfig};
use std::str::FromStr;

#[test]
fn parses_single_server_block_fields() {
    let yaml = "
        host: 0.0.0.0
        ports: [80, 443]
        server_name: myserv
        client_max_body_size: 2048
        routes:
          - path: /
            backend: default
    ";
    let config = ServerConfig::from_str(yaml).unwrap();

    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.ports, vec![80, 443]);
    assert_eq!(config.server_name, "myserv");
    assert_eq!(config.client_max_body_size, 2048);
    assert_eq!(config.routes[0].path, "/");
}

#[test]
fn parses_full_app_config_with_one_server() {
    let yaml = r#"
servers:
  - host: "127.0.0.1"
    ports: [8080, 8081]
    server_name: "test_server"
    default_server: true
    client_max_body_size: 1024
    routes:
      - path: "/"
        methods: ["GET"]
        backend: "default"
"#;
    let config = AppConfig::from_str(yaml).expect("should parse valid config");
    assert_eq!(config.servers.len(), 1);
    let server = &config.servers[0];
    assert_eq!(server.host, "127.0.0.1");
    assert_eq!(server.ports, vec![8080, 8081]);
    assert_eq!(server.server_name, "test_server");
    assert!(server.default_server);
    assert_eq!(server.client_max_body_size, 1024);
    assert_eq!(server.routes.len(), 1);
    assert_eq!(server.routes[0].path, "/");
}

#[test]
fn parses_two_server_blocks() {
    let yaml = "
        servers:
          - server_name: web1
            host: 127.0.0.1
            ports: [8080, 8081]
            routes:
              - path: /
                backend: web1_backend
          - server_name: web2
            host: 127.0.0.1
            ports: [9090]
            routes:
              - path: /
                backend: web2_backend
    ";
    let config = AppConfig::from_str(yaml).unwrap();
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[0].server_name, "web1");
    assert_eq!(config.servers[1].ports, vec![9090]);
}

#[test]
fn unknown_top_level_field_is_ignored() {
    let yaml = "
servers:
  - host: \"127.0.0.1\"
    unknown_field: \"some_value\"
    server_name: \"test\"
";
    let config = AppConfig::from_str(yaml).expect("unknown fields are ignored, not rejected");
    assert_eq!(config.servers[0].host, "127.0.0.1");
    assert_eq!(config.servers[0].server_name, "test");
}

#[test]
fn malformed_mapping_is_rejected() {
    let yaml = "host : : 127.0.0.1";
    assert!(ServerConfig::from_str(yaml).is_err());
}

#[test]
fn type_mismatch_on_client_max_body_size_is_rejected() {
    let yaml = "client_max_body_size: not_a_number";
    assert!(ServerConfig::from_str(yaml).is_err());
}

#[test]
fn type_mismatch_inside_port_list_is_rejected() {
    let yaml = "ports: [8080, not_a_port]";
    assert!(ServerConfig::from_str(yaml).is_err());
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let yaml = "server_name: test_default";
    let config = ServerConfig::from_str(yaml).unwrap();

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.ports, vec![8080]);
    assert_eq!(config.routes.len(), 1);
}

#[test]
fn error_pages_default_to_empty() {
    let yaml = "host: 127.0.0.1";
    let config = ServerConfig::from_str(yaml).unwrap();
    assert!(config.error_pages.is_empty());
}

#[test]
fn cache_enabled_defaults_to_true() {
    let yaml = "host: 127.0.0.1";
    let config = ServerConfig::from_str(yaml).unwrap();
    assert!(config.cache_enabled);
}

#[test]
fn route_force_pass_defaults_to_false() {
    let yaml = "
        routes:
          - path: /admin
    ";
    let config = ServerConfig::from_str(yaml).unwrap();
    assert!(!config.routes[0].force_pass);
}
