//! 요청 생명주기 상태
//!
//! 요청 하나는 다음 순서로만 전이합니다:
//!
//! ```text
//! Idle -> Admitted -> Analyzing -> Finalizing -> Done
//!   \______________________________________/
//!          (승인되지 않은 요청은 바로 Done)
//! ```
//!
//! 정리(finalize)는 [`LifecycleCell::begin_finalize`]의 CAS를 통과한 호출자 하나만 수행합니다.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 요청 생명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// 아직 분석 대상이 아님
    Idle = 0,
    /// 오버헤드 제어를 통과함
    Admitted = 1,
    /// 요청 컨텍스트가 저장되고 분석 중
    Analyzing = 2,
    /// 정리 중
    Finalizing = 3,
    /// 종료됨
    Done = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Admitted,
            2 => Self::Analyzing,
            3 => Self::Finalizing,
            _ => Self::Done,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Admitted => write!(f, "admitted"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// 원자적 상태 셀
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    /// `Idle` 상태로 생성합니다.
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Idle as u8))
    }

    /// 현재 상태
    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 현재 상태가 `from`일 때만 `to`로 전이합니다.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 정리 권한을 얻습니다.
    ///
    /// 성공하면 직전 상태를 반환합니다. `Idle`은 바로 `Done`이 되고,
    /// `Admitted`/`Analyzing`은 `Finalizing`이 됩니다. 이미 정리 중이거나
    /// 종료된 요청이면 `None`입니다.
    pub fn begin_finalize(&self) -> Option<LifecycleState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match LifecycleState::from_u8(raw) {
                    LifecycleState::Idle => Some(LifecycleState::Done as u8),
                    LifecycleState::Admitted | LifecycleState::Analyzing => {
                        Some(LifecycleState::Finalizing as u8)
                    }
                    LifecycleState::Finalizing | LifecycleState::Done => None,
                }
            })
            .ok()
            .map(LifecycleState::from_u8)
    }

    /// 종료 상태로 표시합니다.
    pub fn mark_done(&self) {
        self.0.store(LifecycleState::Done as u8, Ordering::Release);
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn transitions_follow_order() {
        let cell = LifecycleCell::new();
        assert!(cell.transition(LifecycleState::Idle, LifecycleState::Admitted));
        assert!(!cell.transition(LifecycleState::Idle, LifecycleState::Admitted));
        assert!(cell.transition(LifecycleState::Admitted, LifecycleState::Analyzing));
        assert_eq!(cell.get(), LifecycleState::Analyzing);
    }

    #[test]
    fn idle_finalizes_straight_to_done() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.begin_finalize(), Some(LifecycleState::Idle));
        assert_eq!(cell.get(), LifecycleState::Done);
        assert_eq!(cell.begin_finalize(), None);
    }

    #[test]
    fn analyzing_finalizes_once() {
        let cell = LifecycleCell::new();
        cell.transition(LifecycleState::Idle, LifecycleState::Admitted);
        cell.transition(LifecycleState::Admitted, LifecycleState::Analyzing);

        assert_eq!(cell.begin_finalize(), Some(LifecycleState::Analyzing));
        assert_eq!(cell.get(), LifecycleState::Finalizing);
        assert_eq!(cell.begin_finalize(), None);

        cell.mark_done();
        assert_eq!(cell.get(), LifecycleState::Done);
    }

    #[test]
    fn concurrent_finalize_has_single_winner() {
        let cell = Arc::new(LifecycleCell::new());
        cell.transition(LifecycleState::Idle, LifecycleState::Admitted);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || cell.begin_finalize().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
