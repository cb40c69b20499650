//! 설정 관리 — reqshield.toml 파싱 및 런타임 설정
//!
//! [`ReqshieldConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`REQSHIELD_WAF_TIMEOUT_MS=10` 형식)
//! 3. 설정 파일 (`reqshield.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), reqshield_core::error::ReqshieldError> {
//! use reqshield_core::config::ReqshieldConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = ReqshieldConfig::load("reqshield.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = ReqshieldConfig::parse("[waf]\ntimeout_ms = 10")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ReqshieldError};

/// 엔진 호출 타임아웃 상한 (밀리초)
const MAX_WAF_TIMEOUT_MS: u64 = 10_000;

/// reqshield 통합 설정
///
/// `reqshield.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReqshieldConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 탐지 엔진(WAF) 설정
    #[serde(default)]
    pub waf: WafConfig,
    /// 오버헤드 제어(어드미션) 설정
    #[serde(default)]
    pub overhead: OverheadConfig,
    /// 취약점 리포터 설정
    #[serde(default)]
    pub reporter: ReporterConfig,
    /// 텔레메트리 설정
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ReqshieldConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ReqshieldError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ReqshieldError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReqshieldError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                ReqshieldError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, ReqshieldError> {
        toml::from_str(toml_str).map_err(|e| {
            ReqshieldError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `REQSHIELD_{SECTION}_{FIELD}`
    /// 예: `REQSHIELD_OVERHEAD_MAX_CONCURRENT_REQUESTS=4`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "REQSHIELD_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "REQSHIELD_GENERAL_LOG_FORMAT");

        // WAF
        override_bool(&mut self.waf.enabled, "REQSHIELD_WAF_ENABLED");
        override_string(&mut self.waf.rules_path, "REQSHIELD_WAF_RULES_PATH");
        override_u64(&mut self.waf.timeout_ms, "REQSHIELD_WAF_TIMEOUT_MS");

        // Overhead
        override_usize(
            &mut self.overhead.max_concurrent_requests,
            "REQSHIELD_OVERHEAD_MAX_CONCURRENT_REQUESTS",
        );
        override_u32(
            &mut self.overhead.sampling_budget,
            "REQSHIELD_OVERHEAD_SAMPLING_BUDGET",
        );
        override_u64(
            &mut self.overhead.sampling_window_ms,
            "REQSHIELD_OVERHEAD_SAMPLING_WINDOW_MS",
        );
        override_u32(
            &mut self.overhead.max_vulnerabilities_per_request,
            "REQSHIELD_OVERHEAD_MAX_VULNERABILITIES_PER_REQUEST",
        );

        // Reporter
        override_u64(
            &mut self.reporter.dedup_window_secs,
            "REQSHIELD_REPORTER_DEDUP_WINDOW_SECS",
        );
        override_usize(
            &mut self.reporter.max_summary_findings,
            "REQSHIELD_REPORTER_MAX_SUMMARY_FINDINGS",
        );

        // Telemetry
        if let Ok(val) = std::env::var("REQSHIELD_TELEMETRY_VERBOSITY") {
            match val.parse::<TelemetryVerbosity>() {
                Ok(parsed) => self.telemetry.verbosity = parsed,
                Err(_) => warn!(
                    env_key = "REQSHIELD_TELEMETRY_VERBOSITY",
                    value = val.as_str(),
                    "failed to parse telemetry verbosity from env var, ignoring"
                ),
            }
        }

        // Metrics
        override_bool(&mut self.metrics.enabled, "REQSHIELD_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "REQSHIELD_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "REQSHIELD_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ReqshieldError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.waf.enabled {
            if self.waf.timeout_ms == 0 || self.waf.timeout_ms > MAX_WAF_TIMEOUT_MS {
                return Err(invalid(
                    "waf.timeout_ms",
                    format!("must be 1-{MAX_WAF_TIMEOUT_MS}"),
                ));
            }

            if !self.waf.rules_path.is_empty() && !self.waf.rules_inline.is_empty() {
                return Err(invalid(
                    "waf.rules_inline",
                    "rules_path and rules_inline are mutually exclusive".to_owned(),
                ));
            }
        }

        if self.overhead.max_concurrent_requests == 0 {
            return Err(invalid(
                "overhead.max_concurrent_requests",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.overhead.sampling_window_ms == 0 {
            return Err(invalid(
                "overhead.sampling_window_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.reporter.max_summary_findings == 0 {
            return Err(invalid(
                "reporter.max_summary_findings",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.reporter.event_channel_capacity == 0 {
            return Err(invalid(
                "reporter.event_channel_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.metrics.enabled && self.metrics.endpoint != "/metrics" {
            return Err(invalid(
                "metrics.endpoint",
                "only '/metrics' is supported".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> ReqshieldError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 탐지 엔진(WAF) 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 룰셋 파일 경로 (YAML)
    pub rules_path: String,
    /// 인라인 룰셋 내용 (YAML, `rules_path`와 배타적)
    pub rules_inline: String,
    /// 엔진 호출 1회당 타임아웃 (밀리초)
    pub timeout_ms: u64,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules_path: String::new(),
            rules_inline: String::new(),
            timeout_ms: 5,
        }
    }
}

/// 오버헤드 제어 설정
///
/// 동시 분석 요청 상한과 시간 창 단위 샘플링 예산을 지정합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverheadConfig {
    /// 동시에 심층 분석할 수 있는 최대 요청 수
    pub max_concurrent_requests: usize,
    /// 샘플링 창 하나에서 분석을 허용할 최대 요청 수
    pub sampling_budget: u32,
    /// 샘플링 창 길이 (밀리초)
    pub sampling_window_ms: u64,
    /// 요청당 기록할 수 있는 최대 취약점 수
    pub max_vulnerabilities_per_request: u32,
}

impl Default for OverheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 2,
            sampling_budget: 30,
            sampling_window_ms: 1_000,
            max_vulnerabilities_per_request: 2,
        }
    }
}

/// 취약점 리포터 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// 요청 간 중복 제거 윈도우 (초, 0이면 비활성화)
    pub dedup_window_secs: u64,
    /// 스팬 요약에 포함할 최대 취약점 수
    pub max_summary_findings: usize,
    /// 보안 이벤트 채널 용량
    pub event_channel_capacity: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 3_600,
            max_summary_findings: 32,
            event_channel_capacity: 1_024,
        }
    }
}

/// 텔레메트리 상세 수준
///
/// 수준이 높을수록 더 많은 메트릭을 기록합니다.
/// `Off < Mandatory < Information < Debug` 순서로 비교됩니다.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryVerbosity {
    /// 메트릭을 기록하지 않음
    Off,
    /// 필수 메트릭만 기록
    Mandatory,
    /// 요청 단위 메트릭까지 기록 (기본값)
    #[default]
    Information,
    /// 엔진 호출 세부 타이밍까지 기록
    Debug,
}

impl fmt::Display for TelemetryVerbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Mandatory => write!(f, "mandatory"),
            Self::Information => write!(f, "information"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for TelemetryVerbosity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "mandatory" => Ok(Self::Mandatory),
            "information" => Ok(Self::Information),
            "debug" => Ok(Self::Debug),
            other => Err(ConfigError::InvalidValue {
                field: "telemetry.verbosity".to_owned(),
                reason: format!("unknown verbosity '{other}'"),
            }),
        }
    }
}

/// 텔레메트리 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// 메트릭 상세 수준
    pub verbosity: TelemetryVerbosity,
}

/// Prometheus 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}
