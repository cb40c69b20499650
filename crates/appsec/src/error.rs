//! 보안 분석 파이프라인 에러 타입
//!
//! [`AppsecError`]는 파이프라인 내부에서 발생하는 모든 에러를 표현합니다.
//! 대부분은 요청 경로로 전파되지 않고 로그로 남긴 뒤 버려집니다(fail open).
//! 생성 시점의 에러(룰셋, 설정)만 `?`로 상위 레이어에 전달되며,
//! 이를 위해 `From<AppsecError> for ReqshieldError` 변환을 제공합니다.

use reqshield_core::error::{ConfigError, DetectionError, PipelineError, ReqshieldError};
use reqshield_core::span::SpanError;

/// 보안 분석 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum AppsecError {
    /// 탐지 엔진 호출 실패 (잘못된 입력, 내부 오류)
    #[error("engine fault: {0}")]
    EngineFault(String),

    /// 호출 측 계약 위반 (중복 등록, 해제 후 실행 등)
    #[error("lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// 취약점 보고 또는 스팬 태그 기록 실패
    #[error("reporting fault: {0}")]
    ReportingFault(String),

    /// 룰셋 로딩 실패
    #[error("ruleset error: {source_name}: {reason}")]
    Ruleset {
        /// 룰셋 출처 (파일 경로 또는 "inline")
        source_name: String,
        /// 실패 사유
        reason: String,
    },

    /// 룰 유효성 검증 실패
    #[error("rule validation error: rule '{rule_id}': {reason}")]
    RuleValidation {
        /// 문제가 된 룰 ID
        rule_id: String,
        /// 검증 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },
}

impl From<SpanError> for AppsecError {
    fn from(err: SpanError) -> Self {
        AppsecError::ReportingFault(err.to_string())
    }
}

impl From<AppsecError> for ReqshieldError {
    fn from(err: AppsecError) -> Self {
        match err {
            AppsecError::EngineFault(reason) => {
                ReqshieldError::Detection(DetectionError::Engine(reason))
            }
            e @ (AppsecError::Ruleset { .. } | AppsecError::RuleValidation { .. }) => {
                ReqshieldError::Detection(DetectionError::Ruleset(e.to_string()))
            }
            AppsecError::Config { field, reason } => {
                ReqshieldError::Config(ConfigError::InvalidValue { field, reason })
            }
            other => ReqshieldError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
