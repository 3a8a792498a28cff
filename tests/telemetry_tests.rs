//! Global subscriber installation.
//!
//! Kept in its own test binary because installing a subscriber is
//! process-wide.

use gangway::{LogFormat, LoggingConfig, init_logging};

#[test]
fn only_the_first_installation_succeeds() {
    let config = LoggingConfig {
        level: "debug",
        format: LogFormat::Json,
    };

    init_logging(&config).expect("first installation succeeds");
    let err = init_logging(&config).expect_err("a global subscriber is already set");
    assert!(err.to_string().contains("tracing subscriber"), "{err}");
}
