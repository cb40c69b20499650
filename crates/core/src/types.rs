//! 도메인 타입 — 시스템 전역에서 사용되는 공통 타입
//!
//! 요청 식별자, 주소(attribute) 맵, 엔진이 요청하는 완화 액션을 정의합니다.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// 요청/응답 주소 맵
///
/// 키는 주소 이름(예: `server.request.query`), 값은 임의의 JSON 값입니다.
/// 순서가 보장되므로 엔진 입력과 로그 출력이 결정적입니다.
pub type Attributes = BTreeMap<String, serde_json::Value>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// 요청 식별자
///
/// 하나의 요청 레코드에 대해 프로세스 내에서 유일하며,
/// 요청이 끝날 때까지 변하지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// 새로운 고유 ID를 발급합니다.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 원시 값으로부터 ID를 만듭니다.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 원시 값을 반환합니다.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// 탐지 엔진이 요청하는 완화 액션
///
/// 엔진은 액션을 요청만 하며, 실제 집행은 호출 측 정책이 결정합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// 요청 차단 (차단 응답 렌더링)
    Block,
    /// 지정 위치로 리다이렉트
    Redirect {
        /// 리다이렉트 대상 URL
        location: String,
    },
    /// 스택 트레이스 수집 등 엔진 정의 액션
    Custom(String),
}

impl Action {
    /// 요청을 종료시키는 액션인지 여부
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Block | Self::Redirect { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Redirect { location } => write!(f, "redirect({location})"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::from_raw(42).to_string(), "req-42");
    }

    #[test]
    fn blocking_actions() {
        assert!(Action::Block.is_blocking());
        assert!(
            Action::Redirect {
                location: "/denied".to_owned()
            }
            .is_blocking()
        );
        assert!(!Action::Custom("stack_trace".to_owned()).is_blocking());
    }

    #[test]
    fn action_serde_uses_snake_case() {
        let json = serde_json::to_string(&Action::Block).unwrap();
        assert_eq!(json, "\"block\"");
        let parsed: Action = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(parsed, Action::Block);
    }
}
