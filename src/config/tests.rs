use super::types::*;
use super::validate_node;
use crate::error::BalancerError;
use std::time::Duration;

fn config_with_nodes(nodes: Vec<NodeConfig>) -> BalancerConfig {
    BalancerConfig {
        nodes,
        ..BalancerConfig::default()
    }
}

#[test]
fn test_defaults() {
    let cfg = BalancerConfig::default();
    assert_eq!(cfg.listen, "0.0.0.0:8023");
    assert_eq!(cfg.probe.mode, ProbeMode::Auto);
    assert_eq!(cfg.probe.interval, Duration::from_secs(5));
    assert_eq!(cfg.probe.timeout, Duration::from_secs(2));
    assert_eq!(cfg.health, HealthThresholds {
        degrade_threshold: 2,
        down_threshold: 3,
        recover_threshold: 2,
    });
    assert_eq!(cfg.relay.session_timeout, Duration::ZERO);
    assert!(!cfg.discovery.enabled());
    assert!(!cfg.alerts.enabled());
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        listen = "127.0.0.1:9100"

        [[nodes]]
        host = "10.0.0.1"
        port = 8443

        [[nodes]]
        host = "10.0.0.2"
        port = 8443
        weight = 3
        priority = 1

        [probe]
        mode = "tcp"
        interval = 2
        timeout = "750ms"

        [health]
        degrade_threshold = 1

        [relay]
        idle_timeout = "1m"
    "#;
    let cfg: BalancerConfig = toml::from_str(toml).unwrap();
    assert_eq!(cfg.listen, "127.0.0.1:9100");
    assert_eq!(cfg.nodes.len(), 2);
    assert_eq!(cfg.nodes[0].weight, 1);
    assert_eq!(cfg.nodes[1], NodeConfig::new("10.0.0.2", 8443).with_weight(3).with_priority(1));
    assert_eq!(cfg.probe.mode, ProbeMode::Tcp);
    assert_eq!(cfg.probe.interval, Duration::from_secs(2));
    assert_eq!(cfg.probe.timeout, Duration::from_millis(750));
    assert_eq!(cfg.health.degrade_threshold, 1);
    assert_eq!(cfg.health.down_threshold, 3);
    assert_eq!(cfg.relay.idle_timeout, Duration::from_secs(60));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_load_json_config_file() {
    let json = r#"{
        "listen": "127.0.0.1:9101",
        "nodes": [{"host": "127.0.0.1", "port": 8081, "weight": 2}],
        "probe": {"interval": 1, "timeout": 0.5}
    }"#;
    let tmp = std::env::temp_dir().join("marz_balancer_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = BalancerConfig::load(&tmp).unwrap();
    assert_eq!(cfg.nodes.len(), 1);
    assert_eq!(cfg.probe.timeout, Duration::from_millis(500));
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_rejects_unknown_extension() {
    let tmp = std::env::temp_dir().join("marz_balancer_test_config.yaml");
    std::fs::write(&tmp, "listen: x").unwrap();
    assert!(BalancerConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_requires_nodes_or_discovery() {
    let cfg = BalancerConfig::default();
    assert!(matches!(cfg.validate(), Err(BalancerError::Config(_))));

    let mut cfg = BalancerConfig::default();
    cfg.discovery.panel_url = Some("https://panel.example.com".into());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_invalid_listen_fails() {
    let mut cfg = config_with_nodes(vec![NodeConfig::new("10.0.0.1", 8443)]);
    cfg.listen = "not-an-address".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_nodes_fails() {
    let cfg = config_with_nodes(vec![
        NodeConfig::new("10.0.0.1", 8443),
        NodeConfig::new("10.0.0.1", 8443).with_weight(2),
    ]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_timeout_exceeding_interval_fails() {
    let mut cfg = config_with_nodes(vec![NodeConfig::new("10.0.0.1", 8443)]);
    cfg.probe.interval = Duration::from_secs(1);
    cfg.probe.timeout = Duration::from_secs(2);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_threshold_fails() {
    let mut cfg = config_with_nodes(vec![NodeConfig::new("10.0.0.1", 8443)]);
    cfg.health.recover_threshold = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_metrics_listen_fails() {
    let mut cfg = config_with_nodes(vec![NodeConfig::new("10.0.0.1", 8443)]);
    cfg.metrics.listen = Some("localhost".into());
    assert!(cfg.validate().is_err());
    cfg.metrics.listen = Some("127.0.0.1:9090".into());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_node_rejects_malformed() {
    assert!(validate_node(&NodeConfig::new("", 80)).is_err());
    assert!(validate_node(&NodeConfig::new("http://x", 80)).is_err());
    assert!(validate_node(&NodeConfig::new("a b", 80)).is_err());
    assert!(validate_node(&NodeConfig::new("a", 0)).is_err());
    assert!(validate_node(&NodeConfig::new("a", 80).with_weight(0)).is_err());
    assert!(validate_node(&NodeConfig::new("a", 80)).is_ok());
}

#[test]
fn test_probe_mode_from_str() {
    assert_eq!("AUTO".parse::<ProbeMode>().unwrap(), ProbeMode::Auto);
    assert_eq!("ping".parse::<ProbeMode>().unwrap(), ProbeMode::Icmp);
    assert_eq!("connect".parse::<ProbeMode>().unwrap(), ProbeMode::Tcp);
    assert!("udp".parse::<ProbeMode>().is_err());
}

#[test]
fn test_parse_duration_forms() {
    assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    assert_eq!(parse_duration("0.25").unwrap(), Duration::from_millis(250));
    assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
    assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    assert!(parse_duration("-1").is_err());
    assert!(parse_duration("later").is_err());
}
