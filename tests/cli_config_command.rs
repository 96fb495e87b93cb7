//! Integration tests for the `acp-gateway config` subcommand
//!
//! Verifies that the generated template round-trips through a file into a
//! valid configuration.

use acp_gateway::cli::generate_config_template;
use acp_gateway::config::Config;
use std::fs;
use tempfile::TempDir;

fn create_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

// ─────────────────────────────────────────────────────────────────────────────
// Template Content Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_generated_template_creates_valid_config_file() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("config.toml");

    fs::write(&config_path, generate_config_template()).expect("Failed to write template");

    let config =
        Config::from_file(&config_path).expect("Generated template should load as valid Config");

    assert_eq!(config.models.default, "sonnet");
    assert!(config.models.find("haiku").is_some());
    assert_eq!(config.pool.capacity, 2);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.agent.token_env, "ACP_ACCESS_TOKEN");
    assert!(config.agent.credentials_path.is_none());
}

#[test]
fn test_template_has_all_sections() {
    let template = generate_config_template();
    for section in [
        "[server]",
        "[agent]",
        "[pool]",
        "[retry]",
        "[models]",
        "[[models.catalog]]",
        "[observability]",
    ] {
        assert!(template.contains(section), "template is missing {section}");
    }
}

#[test]
fn test_template_file_content_matches_generation() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("nested-config.toml");

    fs::write(&config_path, generate_config_template()).expect("Failed to write template");
    let written = fs::read_to_string(&config_path).expect("Failed to read template back");
    assert_eq!(written, generate_config_template());
}
