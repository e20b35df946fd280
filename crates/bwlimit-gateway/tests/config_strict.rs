#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use bwlimit_gateway::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
shaping:
  check_interval_ms: 1000
  bypass_user: ["ops"] # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind().as_str(), "BAD_CONFIG");
}

#[test]
fn ok_minimal_config() {
    let cfg = config::load_from_str("version: 1\n").expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.gateway.listen, "0.0.0.0:8080");
    assert_eq!(cfg.gateway.log_filter, "info");
    assert_eq!(cfg.shaping.check_interval_ms, 1000);
    assert_eq!(cfg.shaping.initial_default_limit.bytes_per_sec(), 524_288);
    assert_eq!(cfg.shaping.policy_path, "bwlimit-policy.yaml");
    assert!(cfg.shaping.bypass_users.is_empty());
    assert!(cfg.admin.enabled);
}

#[test]
fn full_config() {
    let ok = r#"
version: 1
gateway:
  listen: "127.0.0.1:9000"
  ping_interval_ms: 10000
  idle_timeout_ms: 30000
  log_filter: "debug"
shaping:
  check_interval_ms: 250
  policy_path: "/var/lib/bwlimit/policy.yaml"
  initial_default_limit: 65536
  bypass_users: ["ops", "monitor"]
admin:
  enabled: false
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.shaping.check_interval().as_millis(), 250);
    assert_eq!(cfg.shaping.bypass_users, vec!["ops", "monitor"]);
    assert!(!cfg.admin.enabled);
}

#[test]
fn unsupported_version() {
    let err = config::load_from_str("version: 2\n").expect_err("must fail");
    assert_eq!(err.kind().as_str(), "UNSUPPORTED_VERSION");
}

#[test]
fn zero_default_limit_rejected() {
    let bad = "version: 1\nshaping:\n  initial_default_limit: 0\n";
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind().as_str(), "BAD_CONFIG");
}

#[test]
fn out_of_range_values_rejected() {
    for bad in [
        "version: 1\nshaping:\n  check_interval_ms: 50\n",
        "version: 1\ngateway:\n  ping_interval_ms: 1000\n",
        "version: 1\ngateway:\n  ping_interval_ms: 30000\n  idle_timeout_ms: 20000\n",
    ] {
        let err = config::load_from_str(bad).expect_err("must fail");
        assert_eq!(err.kind().as_str(), "BAD_CONFIG", "{bad}");
    }
}
