use std::io::Write;

use trellis_core::config::AppConfig;
use trellis_core::event::BackpressurePolicy;
use trellis_core::graph::GraphDefinition;
use trellis_core::TrellisError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
event_buffer = 32
backpressure = "block"

[persistence]
queue_capacity = 64
max_in_flight = 8

[safety]
max_node_visits = 25

[log]
filter = "trellis=debug,warn"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.event_buffer, 32);
    assert_eq!(config.engine.backpressure, BackpressurePolicy::Block);
    assert_eq!(config.persistence.queue_capacity, 64);
    assert_eq!(config.persistence.max_in_flight, 8);
    assert_eq!(config.safety.max_node_visits, 25);
    assert_eq!(config.log.filter, "trellis=debug,warn");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TRELLIS_TEST_LOG_FILTER", "trellis_engine=trace");
    let toml_content = r#"
[log]
filter = "${TRELLIS_TEST_LOG_FILTER}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.log.filter, "trellis_engine=trace");
    std::env::remove_var("TRELLIS_TEST_LOG_FILTER");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[safety]\nmax_node_visits = 0\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.safety.max_node_visits, 0);
    assert_eq!(config.engine.event_buffer, 100);
    assert_eq!(config.engine.backpressure, BackpressurePolicy::DropNewest);
    assert_eq!(config.persistence.queue_capacity, 256);
    assert_eq!(config.persistence.max_in_flight, 4);
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nevent_buffer = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, TrellisError::Config(_)));
}

#[test]
fn test_load_graph_json_from_file() {
    let json = r#"{
        "workflow_uuid": "wf-debate",
        "name": "Debate",
        "description": "Two agents argue, a judge decides",
        "start_node_id": "start",
        "nodes": {
            "start": {"node_id": "start", "type": "start", "name": "Start", "next_ids": ["fan"]},
            "fan": {"node_id": "fan", "type": "parallel", "name": "Fan out", "next_ids": ["pro", "con"]},
            "pro": {"node_id": "pro", "type": "agent", "name": "Pro", "next_ids": ["judge"], "properties": {"agent_uuid": "a-1"}},
            "con": {"node_id": "con", "type": "agent", "name": "Con", "next_ids": ["judge"]},
            "judge": {"node_id": "judge", "type": "vote", "name": "Judge", "next_ids": ["end"]},
            "end": {"node_id": "end", "type": "end", "name": "End"}
        }
    }"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(json.as_bytes()).expect("write json");

    let text = std::fs::read_to_string(tmp.path()).expect("read back");
    let graph = GraphDefinition::from_json(&text).expect("parse graph");

    assert_eq!(graph.id, "wf-debate");
    assert_eq!(graph.nodes.len(), 6);
    assert!(graph.nodes["fan"].is_parallel());
    assert_eq!(graph.nodes["pro"].property_str("agent_uuid"), Some("a-1"));
    assert_eq!(graph.in_degrees()["judge"], 2);
    graph.validate().expect("valid graph");
}
