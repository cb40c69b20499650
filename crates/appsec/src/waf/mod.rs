//! 탐지 엔진(WAF) 연동
//!
//! 파이프라인은 룰 매칭 알고리즘을 직접 구현하지 않습니다.
//! 엔진은 [`DetectionEngine`] / [`EngineContext`] trait 뒤에 숨겨진
//! 불투명한 컴포넌트이며, 입력(주소 맵)을 받아 매칭 결과와 액션을 돌려줍니다.
//!
//! - [`context::WafContext`]: 요청 하나에 대한 엔진 핸들 (주소 필터링, 타임아웃, 메트릭)
//! - [`ruleset::RulesetEngine`]: YAML 룰셋 기반 참조 구현

pub mod context;
pub mod ruleset;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use reqshield_core::types::{Action, Attributes};

use crate::error::AppsecError;

pub use context::{WafContext, WafRunResult};
pub use ruleset::RulesetEngine;

/// 주소 이름 상수
///
/// 룰셋이 소비할 수 있는 입력 키입니다.
pub mod addresses {
    /// 원본 요청 URI
    pub const REQUEST_URI_RAW: &str = "server.request.uri.raw";
    /// 요청 메서드
    pub const REQUEST_METHOD: &str = "server.request.method";
    /// 쿠키를 제외한 요청 헤더
    pub const REQUEST_HEADERS_NO_COOKIES: &str = "server.request.headers.no_cookies";
    /// 쿼리 파라미터
    pub const REQUEST_QUERY: &str = "server.request.query";
    /// 파싱된 요청 본문
    pub const REQUEST_BODY: &str = "server.request.body";
    /// 클라이언트 IP
    pub const REQUEST_CLIENT_IP: &str = "server.request.client_ip";
    /// 응답 상태 코드
    pub const RESPONSE_STATUS: &str = "server.response.status";
    /// 쿠키를 제외한 응답 헤더
    pub const RESPONSE_HEADERS_NO_COOKIES: &str = "server.response.headers.no_cookies";
    /// 인증된 사용자 ID
    pub const USER_ID: &str = "usr.id";
}

/// 엔진 호출 1회의 결과
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// 매칭 결과 (엔진 정의 JSON, 비어 있으면 공격 없음)
    pub events: Vec<serde_json::Value>,
    /// 요청된 완화 액션
    pub actions: Vec<Action>,
    /// 엔진이 보고한 실행 시간
    pub total_runtime: Duration,
    /// 예산을 모두 써서 부분 결과만 반환했는지 여부
    pub timed_out: bool,
}

/// 요청 하나에 대한 엔진 측 컨텍스트
///
/// 같은 요청의 여러 호출 사이에 상태(이미 매칭된 룰 등)를 유지할 수 있습니다.
pub trait EngineContext: Send {
    /// 입력을 평가합니다.
    ///
    /// `budget`은 엔진에 주어진 시간 예산입니다. 예산을 넘기면 부분 결과와
    /// 함께 `timed_out = true`를 반환해야 하며, 이는 에러가 아닙니다.
    fn run(
        &mut self,
        inputs: &Attributes,
        budget: Duration,
    ) -> impl Future<Output = Result<EngineOutcome, AppsecError>> + Send;

    /// 엔진 측 자원을 해제합니다.
    fn dispose(&mut self);
}

/// 컴파일된 룰셋에 대한 핸들
///
/// `Send + Sync + 'static` 바운드로 파이프라인 태스크 간 공유를 보장합니다.
pub trait DetectionEngine: Send + Sync + 'static {
    /// 요청별 컨텍스트 타입
    type Context: EngineContext + 'static;

    /// 룰셋이 실제로 소비하는 주소 집합
    fn required_addresses(&self) -> &HashSet<String>;

    /// 룰셋 버전
    fn rules_version(&self) -> &str;

    /// 요청별 컨텍스트를 생성합니다.
    fn new_context(&self) -> Result<Self::Context, AppsecError>;
}
