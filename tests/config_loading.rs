use std::io::Write;
use std::path::Path;

use strata_core::config::{BackoffStrategy, MergePolicy, StrataConfig};
use strata_core::error::StrataError;
use strata_core::state::State;
use strata_core::trace::RunStatus;
use strata_engine::{GraphDefinition, GraphExecutor};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
step_budget = 25
merge_policy = "reject_conflicts"

[retry]
strategy = "exponential"
base_delay_ms = 50
max_delay_ms = 800

[trace]
enabled = false
log_dir = "/tmp/strata-traces"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = StrataConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.step_budget, 25);
    assert_eq!(config.engine.merge_policy, MergePolicy::RejectConflicts);
    assert_eq!(config.retry.strategy, BackoffStrategy::Exponential);
    assert_eq!(config.retry.base_delay_ms, 50);
    assert_eq!(config.retry.max_delay_ms, 800);
    assert!(!config.trace.enabled);
    assert_eq!(
        config.trace.log_dir().as_deref(),
        Some(Path::new("/tmp/strata-traces"))
    );
}

#[test]
fn test_partial_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nstep_budget = 3\n").expect("write toml");

    let config = StrataConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.step_budget, 3);
    assert_eq!(config.engine.merge_policy, MergePolicy::LastWriterWins);
    assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
    assert_eq!(config.retry.base_delay_ms, 100);
    assert!(config.trace.enabled);
    assert!(config.trace.log_dir().is_none());
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("STRATA_TEST_TRACE_DIR", "/var/tmp/strata");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[trace]\nlog_dir = \"${STRATA_TEST_TRACE_DIR}\"\n")
        .expect("write toml");

    let config = StrataConfig::load(tmp.path()).expect("load config");
    std::env::remove_var("STRATA_TEST_TRACE_DIR");

    assert_eq!(config.trace.log_dir.as_deref(), Some("/var/tmp/strata"));
}

#[test]
fn test_missing_config_file() {
    let err = StrataConfig::load(Path::new("/nonexistent/strata.toml")).unwrap_err();
    assert!(matches!(err, StrataError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_config_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nstep_budget = 0\n").expect("write toml");
    assert!(matches!(
        StrataConfig::load(tmp.path()),
        Err(StrataError::Config(_))
    ));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmerge_policy = \"first_writer_wins\"\n")
        .expect("write toml");
    assert!(matches!(
        StrataConfig::load(tmp.path()),
        Err(StrataError::Config(_))
    ));
}

#[tokio::test]
async fn test_demo_graph_runs_to_completion() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/review_pipeline.toml");
    let definition = GraphDefinition::load(&path).expect("load demo graph");
    let graph = definition.build().expect("build demo graph");

    let mut config = StrataConfig::default();
    config.retry.base_delay_ms = 1;

    let result = GraphExecutor::new(graph)
        .with_config(config)
        .run(
            State::new().with("priority", "high"),
            definition.start_node().expect("start node"),
        )
        .await
        .expect("demo run");

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.state.get_str("review"), Some("expedited"));
    assert_eq!(result.state.get_bool("published"), Some(true));
    assert!(result.state.get("queued").is_none());
}

#[tokio::test]
async fn test_demo_loop_hits_step_budget() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/polling_loop.toml");
    let definition = GraphDefinition::load(&path).expect("load demo graph");

    let result = GraphExecutor::new(definition.build().expect("build demo graph"))
        .with_step_budget(4)
        .run(State::new(), definition.start_node().expect("start node"))
        .await
        .expect("demo run");

    assert_eq!(result.status, RunStatus::BudgetExhausted);
    assert_eq!(result.state.get_i64("polls"), Some(4));
}
