//! Sleep Prohibition
//!
//! Production code waits on I/O, timers driven by `tokio::time::interval`,
//! or a computed retry/fallback delay. Anything else that sleeps is a
//! polling loop or a race papered over with time.

use architectural_enforcement::{find_sleep_violations, production_sources};

#[test]
fn test_no_sleep_in_production_code() {
    let sources = production_sources();
    assert!(!sources.is_empty(), "No production sources found to scan");

    let violations: Vec<_> = sources.iter().flat_map(find_sleep_violations).collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable sleep uses:");
        eprintln!("  - Backoff delay between retry attempts");
        eprintln!("  - Configured delay between fallback attempts");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Test code (after #[cfg(test)])");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
