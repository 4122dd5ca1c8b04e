//! Blocking I/O Prohibition
//!
//! Async code in the resilience crates uses `tokio` and async `reqwest`.
//! Blocking calls are only tolerated in synchronous functions that run
//! before or outside the runtime, such as configuration loading.

use architectural_enforcement::{find_blocking_io_violations, production_sources};

#[test]
fn test_no_blocking_io_in_production_code() {
    let sources = production_sources();
    assert!(!sources.is_empty(), "No production sources found to scan");

    let violations: Vec<_> = sources
        .iter()
        .flat_map(find_blocking_io_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in async code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nForbidden: std::fs, std::net, std::process::Command, reqwest::blocking");
        eprintln!("Use instead: tokio::fs, tokio::net, tokio::process, reqwest async client");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_config_loading_stays_synchronous() {
    let config = production_sources()
        .into_iter()
        .find(|s| s.path.ends_with("resilience/core/src/config.rs"))
        .expect("config.rs is scanned");

    assert!(config
        .lines
        .iter()
        .any(|line| line.contains("std::fs::read_to_string")));
    assert!(find_blocking_io_violations(&config).is_empty());
}
