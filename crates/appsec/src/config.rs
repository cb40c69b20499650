//! 보안 분석 파이프라인 설정
//!
//! [`AppsecConfig`]는 core의 [`ReqshieldConfig`]에서 파이프라인이 사용하는
//! 값만 추려 `Duration` 등 런타임 타입으로 변환한 설정입니다.
//!
//! # 사용 예시
//! ```ignore
//! use reqshield_core::config::ReqshieldConfig;
//! use reqshield_appsec::config::AppsecConfig;
//!
//! let core_config = ReqshieldConfig::default();
//! let config = AppsecConfig::from_core(&core_config);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqshield_core::config::{ReqshieldConfig, TelemetryVerbosity};

use crate::error::AppsecError;

/// 룰셋 출처
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RulesSource {
    /// 룰이 없는 빈 룰셋
    #[default]
    Empty,
    /// YAML 파일
    File(PathBuf),
    /// 설정에 직접 포함된 YAML
    Inline(String),
}

/// 보안 분석 파이프라인 설정
#[derive(Debug, Clone)]
pub struct AppsecConfig {
    /// 탐지 엔진 실행 여부 (false면 taint 분석만 수행)
    pub waf_enabled: bool,
    /// 룰셋 출처
    pub rules: RulesSource,
    /// 엔진 호출 1회당 타임아웃
    pub waf_timeout: Duration,
    /// 동시에 심층 분석할 수 있는 최대 요청 수
    pub max_concurrent_requests: usize,
    /// 샘플링 창 하나에서 허용할 최대 요청 수
    pub sampling_budget: u32,
    /// 샘플링 창 길이
    pub sampling_window: Duration,
    /// 요청당 최대 취약점 보고 수
    pub max_vulnerabilities_per_request: u32,
    /// 요청 간 취약점 중복 제거 윈도우 (`Duration::ZERO`면 비활성화)
    pub dedup_window: Duration,
    /// 스팬 요약에 포함할 최대 취약점 수
    pub max_summary_findings: usize,
    /// 보안 이벤트 채널 용량
    pub event_channel_capacity: usize,
    /// 텔레메트리 상세 수준
    pub verbosity: TelemetryVerbosity,
}

impl Default for AppsecConfig {
    fn default() -> Self {
        Self::from_core(&ReqshieldConfig::default())
    }
}

impl AppsecConfig {
    /// core 설정에서 파이프라인 설정을 생성합니다.
    pub fn from_core(core: &ReqshieldConfig) -> Self {
        let rules = if !core.waf.rules_path.is_empty() {
            RulesSource::File(PathBuf::from(&core.waf.rules_path))
        } else if !core.waf.rules_inline.is_empty() {
            RulesSource::Inline(core.waf.rules_inline.clone())
        } else {
            RulesSource::Empty
        };

        Self {
            waf_enabled: core.waf.enabled,
            rules,
            waf_timeout: Duration::from_millis(core.waf.timeout_ms),
            max_concurrent_requests: core.overhead.max_concurrent_requests,
            sampling_budget: core.overhead.sampling_budget,
            sampling_window: Duration::from_millis(core.overhead.sampling_window_ms),
            max_vulnerabilities_per_request: core.overhead.max_vulnerabilities_per_request,
            dedup_window: Duration::from_secs(core.reporter.dedup_window_secs),
            max_summary_findings: core.reporter.max_summary_findings,
            event_channel_capacity: core.reporter.event_channel_capacity,
            verbosity: core.telemetry.verbosity,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), AppsecError> {
        if self.waf_enabled && self.waf_timeout.is_zero() {
            return Err(invalid("waf.timeout_ms", "must be greater than 0"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(invalid(
                "overhead.max_concurrent_requests",
                "must be greater than 0",
            ));
        }
        if self.sampling_window.is_zero() {
            return Err(invalid("overhead.sampling_window_ms", "must be greater than 0"));
        }
        if self.max_summary_findings == 0 {
            return Err(invalid(
                "reporter.max_summary_findings",
                "must be greater than 0",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid(
                "reporter.event_channel_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// 주어진 수준의 메트릭을 기록해야 하는지 여부
    pub fn records(&self, level: TelemetryVerbosity) -> bool {
        self.verbosity >= level && level > TelemetryVerbosity::Off
    }
}

fn invalid(field: &str, reason: &str) -> AppsecError {
    AppsecError::Config {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_core_converts_units() {
        let mut core = ReqshieldConfig::default();
        core.waf.timeout_ms = 12;
        core.overhead.sampling_window_ms = 250;
        core.reporter.dedup_window_secs = 60;

        let config = AppsecConfig::from_core(&core);
        assert_eq!(config.waf_timeout, Duration::from_millis(12));
        assert_eq!(config.sampling_window, Duration::from_millis(250));
        assert_eq!(config.dedup_window, Duration::from_secs(60));
        assert_eq!(config.rules, RulesSource::Empty);
    }

    #[test]
    fn from_core_prefers_rules_path() {
        let mut core = ReqshieldConfig::default();
        core.waf.rules_path = "/etc/reqshield/rules.yml".to_owned();
        let config = AppsecConfig::from_core(&core);
        assert_eq!(
            config.rules,
            RulesSource::File(PathBuf::from("/etc/reqshield/rules.yml"))
        );
    }

    #[test]
    fn from_core_inline_rules() {
        let mut core = ReqshieldConfig::default();
        core.waf.rules_inline = "version: '1'\nrules: []\n".to_owned();
        let config = AppsecConfig::from_core(&core);
        assert!(matches!(config.rules, RulesSource::Inline(_)));
    }

    #[test]
    fn default_is_valid() {
        AppsecConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = AppsecConfig {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_requests"));
    }

    #[test]
    fn zero_timeout_allowed_when_waf_disabled() {
        let config = AppsecConfig {
            waf_enabled: false,
            waf_timeout: Duration::ZERO,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn records_respects_verbosity() {
        let config = AppsecConfig {
            verbosity: TelemetryVerbosity::Mandatory,
            ..Default::default()
        };
        assert!(config.records(TelemetryVerbosity::Mandatory));
        assert!(!config.records(TelemetryVerbosity::Information));

        let off = AppsecConfig {
            verbosity: TelemetryVerbosity::Off,
            ..Default::default()
        };
        assert!(!off.records(TelemetryVerbosity::Mandatory));
        assert!(!off.records(TelemetryVerbosity::Off));
    }
}
