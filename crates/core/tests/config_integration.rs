//! reqshield.toml 통합 설정 테스트
//!
//! - reqshield.toml.example 파싱 테스트
//! - 부분 설정 (일부 섹션만) 로딩 테스트
//! - 환경변수 우선순위 테스트
//! - 빈 파일 / 잘못된 형식 에러 테스트

use reqshield_core::config::{ReqshieldConfig, TelemetryVerbosity};
use reqshield_core::error::{ConfigError, ReqshieldError};

const EXAMPLE: &str = include_str!("../../../reqshield.toml.example");

// =============================================================================
// reqshield.toml.example 파싱 테스트
// =============================================================================

#[test]
fn example_config_parses_successfully() {
    let config = ReqshieldConfig::parse(EXAMPLE).expect("example config should parse");

    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
}

#[test]
fn example_config_passes_validation() {
    let config = ReqshieldConfig::parse(EXAMPLE).expect("should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_matches_code_defaults() {
    let example = ReqshieldConfig::parse(EXAMPLE).expect("should parse");
    let defaults = ReqshieldConfig::default();

    assert_eq!(example.waf.enabled, defaults.waf.enabled);
    assert_eq!(example.waf.timeout_ms, defaults.waf.timeout_ms);
    assert_eq!(
        example.overhead.max_concurrent_requests,
        defaults.overhead.max_concurrent_requests
    );
    assert_eq!(
        example.overhead.sampling_budget,
        defaults.overhead.sampling_budget
    );
    assert_eq!(
        example.overhead.sampling_window_ms,
        defaults.overhead.sampling_window_ms
    );
    assert_eq!(
        example.overhead.max_vulnerabilities_per_request,
        defaults.overhead.max_vulnerabilities_per_request
    );
    assert_eq!(
        example.reporter.dedup_window_secs,
        defaults.reporter.dedup_window_secs
    );
    assert_eq!(
        example.reporter.max_summary_findings,
        defaults.reporter.max_summary_findings
    );
    assert_eq!(example.telemetry.verbosity, defaults.telemetry.verbosity);
    assert_eq!(example.metrics.enabled, defaults.metrics.enabled);
    assert_eq!(example.metrics.port, defaults.metrics.port);
}

// =============================================================================
// 부분 설정 테스트
// =============================================================================

#[test]
fn partial_config_overhead_only() {
    let toml = r#"
[overhead]
max_concurrent_requests = 1
sampling_budget = 2
"#;
    let config = ReqshieldConfig::parse(toml).expect("should parse");

    assert_eq!(config.overhead.max_concurrent_requests, 1);
    assert_eq!(config.overhead.sampling_budget, 2);
    // 나머지 필드는 기본값
    assert_eq!(config.overhead.sampling_window_ms, 1_000);
    assert_eq!(config.waf.timeout_ms, 5);
}

#[test]
fn partial_config_inline_rules() {
    let toml = r#"
[waf]
rules_inline = """
version: "1.0.0"
rules: []
"""
"#;
    let config = ReqshieldConfig::parse(toml).expect("should parse");
    assert!(config.waf.rules_inline.contains("version"));
    assert!(config.waf.rules_path.is_empty());
    config.validate().expect("inline rules alone are valid");
}

#[test]
fn partial_config_verbosity() {
    let config = ReqshieldConfig::parse("[telemetry]\nverbosity = \"debug\"\n").expect("parse");
    assert_eq!(config.telemetry.verbosity, TelemetryVerbosity::Debug);
}

// =============================================================================
// 환경변수 우선순위 테스트
// =============================================================================

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[waf]
timeout_ms = 5
"#;

    let original = std::env::var("REQSHIELD_WAF_TIMEOUT_MS").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("REQSHIELD_WAF_TIMEOUT_MS", "20");
    }

    let mut config = ReqshieldConfig::parse(toml).expect("should parse");
    config.apply_env_overrides();
    let result = config.waf.timeout_ms;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("REQSHIELD_WAF_TIMEOUT_MS", val),
            None => std::env::remove_var("REQSHIELD_WAF_TIMEOUT_MS"),
        }
    }

    assert_eq!(result, 20);
}

#[test]
#[serial_test::serial]
fn env_override_verbosity() {
    let original = std::env::var("REQSHIELD_TELEMETRY_VERBOSITY").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("REQSHIELD_TELEMETRY_VERBOSITY", "OFF");
    }

    let mut config = ReqshieldConfig::default();
    config.apply_env_overrides();
    let result = config.telemetry.verbosity;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("REQSHIELD_TELEMETRY_VERBOSITY", val),
            None => std::env::remove_var("REQSHIELD_TELEMETRY_VERBOSITY"),
        }
    }

    assert_eq!(result, TelemetryVerbosity::Off);
}

#[test]
#[serial_test::serial]
fn env_override_invalid_bool_keeps_toml_value() {
    let original = std::env::var("REQSHIELD_WAF_ENABLED").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("REQSHIELD_WAF_ENABLED", "maybe");
    }

    let mut config = ReqshieldConfig::parse("[waf]\nenabled = false\n").expect("parse");
    config.apply_env_overrides();
    let result = config.waf.enabled;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("REQSHIELD_WAF_ENABLED", val),
            None => std::env::remove_var("REQSHIELD_WAF_ENABLED"),
        }
    }

    assert!(!result);
}

// =============================================================================
// 에러 케이스
// =============================================================================

#[test]
fn empty_string_parses_with_defaults() {
    let config = ReqshieldConfig::parse("").expect("empty config should parse");
    assert_eq!(config.overhead.max_concurrent_requests, 2);
    config.validate().expect("defaults are valid");
}

#[test]
fn malformed_toml_returns_parse_error() {
    let err = ReqshieldConfig::parse("[waf\ntimeout_ms = ").unwrap_err();
    assert!(matches!(
        err,
        ReqshieldError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[test]
fn wrong_type_for_numeric_field() {
    let err = ReqshieldConfig::parse("[overhead]\nsampling_budget = \"many\"\n").unwrap_err();
    assert!(matches!(
        err,
        ReqshieldError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[test]
fn unknown_section_is_ignored() {
    let toml = r#"
[unknown]
key = "value"

[general]
log_level = "warn"
"#;
    let config = ReqshieldConfig::parse(toml).expect("unknown sections are ignored");
    assert_eq!(config.general.log_level, "warn");
}

#[tokio::test]
async fn from_file_nonexistent_returns_file_not_found() {
    let result = ReqshieldConfig::from_file("/tmp/reqshield_test_nonexistent_12345.toml").await;
    assert!(matches!(
        result.unwrap_err(),
        ReqshieldError::Config(ConfigError::FileNotFound { .. })
    ));
}

#[tokio::test]
async fn load_example_config_from_disk() {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let example_path = format!("{manifest_dir}/../../reqshield.toml.example");

    let config = ReqshieldConfig::from_file(&example_path)
        .await
        .expect("example should load from disk");
    assert_eq!(config.waf.timeout_ms, 5);
}

#[test]
fn serialize_and_reparse_roundtrip() {
    let mut config = ReqshieldConfig::default();
    config.overhead.sampling_budget = 7;
    config.telemetry.verbosity = TelemetryVerbosity::Mandatory;

    let serialized = toml::to_string(&config).expect("serialize");
    let reparsed = ReqshieldConfig::parse(&serialized).expect("reparse");
    assert_eq!(reparsed.overhead.sampling_budget, 7);
    assert_eq!(reparsed.telemetry.verbosity, TelemetryVerbosity::Mandatory);
}
