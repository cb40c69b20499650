//! reqshield 공통 크레이트
//!
//! 요청 단위 보안 분석 파이프라인이 공유하는 설정, 에러, 이벤트,
//! 메트릭 이름, 트레이스 스팬 추상화, 상태 점검 타입을 제공합니다.

pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod span;
pub mod types;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{ConfigError, DetectionError, PipelineError, ReqshieldError};

// 설정
pub use config::{ReqshieldConfig, TelemetryVerbosity};

// 이벤트
pub use event::{AttackEvent, Event, EventMetadata, SecurityEvent, VulnerabilityEvent};

// 상태 점검
pub use health::HealthStatus;

// 스팬
pub use span::{RecordingSpan, SpanError, TraceSpan};

// 도메인 타입
pub use types::{Action, Attributes, RequestId};
