//! 오버헤드 제어 -- 심층 분석 어드미션 게이트
//!
//! [`OverheadController`]는 보안 분석이 요청 처리 비용의 대부분을 차지하지
//! 않도록 두 개의 독립된 게이트로 분석 대상 요청을 제한합니다.
//!
//! - 동시성 게이트: 동시에 분석 중인 요청 수 < `max_concurrent_requests`
//! - 샘플링 게이트: 현재 창에서 허용된 요청 수 < `sampling_budget`
//!
//! 두 게이트를 모두 통과해야 허용됩니다. 거부는 대기 없이 즉시 `false`이며,
//! 요청은 분석 없이 계속 처리됩니다. 샘플링 창은 백그라운드 타이머가
//! 주기적으로 초기화합니다.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use reqshield_core::metrics as m;
use reqshield_core::types::RequestId;

use crate::config::AppsecConfig;

/// 요청 안에서 할당량이 적용되는 작업
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// 취약점 기록
    ReportVulnerability,
}

/// 요청 하나의 작업 할당량
#[derive(Debug)]
pub struct RequestBudget {
    vulnerabilities: AtomicU32,
}

impl RequestBudget {
    /// 남은 취약점 기록 횟수
    pub fn remaining(&self, operation: Operation) -> u32 {
        match operation {
            Operation::ReportVulnerability => self.vulnerabilities.load(Ordering::Acquire),
        }
    }
}

/// 전역 어드미션 게이트
#[derive(Debug)]
pub struct OverheadController {
    max_concurrent_requests: usize,
    sampling_budget: u32,
    sampling_window: Duration,
    max_vulnerabilities_per_request: u32,
    in_flight: AtomicUsize,
    window_admitted: AtomicU32,
    rollover: Mutex<Option<JoinHandle<()>>>,
}

impl OverheadController {
    /// 설정에서 컨트롤러를 생성합니다.
    pub fn new(config: &AppsecConfig) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests,
            sampling_budget: config.sampling_budget,
            sampling_window: config.sampling_window,
            max_vulnerabilities_per_request: config.max_vulnerabilities_per_request,
            in_flight: AtomicUsize::new(0),
            window_admitted: AtomicU32::new(0),
            rollover: Mutex::new(None),
        }
    }

    /// 요청을 심층 분석 대상으로 허용할지 결정합니다.
    ///
    /// 두 게이트를 모두 통과하면 동시성 슬롯을 하나 점유하고 `true`를 반환합니다.
    /// 이 경우 호출 측은 정확히 한 번 [`release_request`](Self::release_request)를 호출해야 합니다.
    pub fn acquire_request(&self, request_id: RequestId) -> bool {
        let max = self.max_concurrent_requests;
        let slot = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if slot.is_err() {
            counter!(m::OVERHEAD_DENIED_TOTAL, m::LABEL_REASON => "concurrency").increment(1);
            debug!(%request_id, "analysis skipped: concurrency limit reached");
            return false;
        }

        let budget = self.sampling_budget;
        let sampled = self
            .window_admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < budget).then_some(n + 1)
            });
        if sampled.is_err() {
            // 동시성 슬롯 반환
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            counter!(m::OVERHEAD_DENIED_TOTAL, m::LABEL_REASON => "sampling").increment(1);
            debug!(%request_id, "analysis skipped: sampling budget exhausted");
            return false;
        }

        counter!(m::OVERHEAD_ADMITTED_TOTAL).increment(1);
        gauge!(m::OVERHEAD_IN_FLIGHT).set(self.in_flight() as f64);
        true
    }

    /// 동시성 슬롯을 반환합니다.
    ///
    /// 짝이 맞지 않는 호출은 카운터를 0 아래로 내리지 않고 에러 로그만 남깁니다.
    pub fn release_request(&self) {
        let released = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match released {
            Ok(prev) => gauge!(m::OVERHEAD_IN_FLIGHT).set((prev - 1) as f64),
            Err(_) => {
                counter!(m::OVERHEAD_LIFECYCLE_VIOLATIONS_TOTAL).increment(1);
                error!("release_request called without a matching acquire, ignoring");
            }
        }
    }

    /// 샘플링 창을 한 번 넘깁니다.
    pub fn reset_window(&self) {
        self.window_admitted.store(0, Ordering::Release);
    }

    /// 샘플링 창 타이머를 시작합니다. 이미 실행 중이면 아무 일도 하지 않습니다.
    ///
    /// tokio 런타임 안에서 호출해야 합니다.
    pub fn start_global_context(self: &Arc<Self>) {
        let mut rollover = self.rollover.lock().unwrap_or_else(|e| e.into_inner());
        if rollover.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sampling_window;
        *rollover = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 첫 tick은 즉시 완료됩니다
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(controller) => controller.reset_window(),
                    None => break,
                }
            }
        }));
        debug!(
            window_ms = period.as_millis() as u64,
            "overhead sampling window timer started"
        );
    }

    /// 샘플링 창 타이머를 중지합니다. 시작하지 않았으면 아무 일도 하지 않습니다.
    pub fn finish_global_context(&self) {
        let handle = self
            .rollover
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            self.reset_window();
            debug!("overhead sampling window timer stopped");
        }
    }

    /// 샘플링 창 타이머가 실행 중인지 여부
    pub fn is_running(&self) -> bool {
        self.rollover
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// 허용된 요청에 대한 작업 할당량을 만듭니다.
    pub fn initialize_request_context(&self) -> RequestBudget {
        RequestBudget {
            vulnerabilities: AtomicU32::new(self.max_vulnerabilities_per_request),
        }
    }

    /// 할당량이 남아 있으면 하나를 소비하고 `true`를 반환합니다.
    pub fn has_quota(&self, operation: Operation, budget: &RequestBudget) -> bool {
        let counter = match operation {
            Operation::ReportVulnerability => &budget.vulnerabilities,
        };
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// 현재 분석 중인 요청 수
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 현재 창에서 허용된 요청 수
    pub fn window_admitted(&self) -> u32 {
        self.window_admitted.load(Ordering::Acquire)
    }
}

impl Drop for OverheadController {
    fn drop(&mut self) {
        if let Ok(rollover) = self.rollover.get_mut()
            && let Some(handle) = rollover.take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller(max_concurrent: usize, budget: u32, window: Duration) -> OverheadController {
        OverheadController::new(&AppsecConfig {
            max_concurrent_requests: max_concurrent,
            sampling_budget: budget,
            sampling_window: window,
            ..Default::default()
        })
    }

    #[test]
    fn concurrency_ceiling_denies_second_request() {
        let oc = controller(1, 100, Duration::from_secs(1));
        assert!(oc.acquire_request(RequestId::from_raw(1)));
        assert!(!oc.acquire_request(RequestId::from_raw(2)));
        assert_eq!(oc.in_flight(), 1);

        oc.release_request();
        assert!(oc.acquire_request(RequestId::from_raw(3)));
    }

    #[test]
    fn sampling_budget_denies_after_budget() {
        let oc = controller(10, 2, Duration::from_secs(1));
        let results: Vec<bool> = (1..=3)
            .map(|i| oc.acquire_request(RequestId::from_raw(i)))
            .collect();
        assert_eq!(results, vec![true, true, false]);
        // 거부된 요청은 동시성 슬롯을 점유하지 않음
        assert_eq!(oc.in_flight(), 2);

        oc.reset_window();
        assert!(oc.acquire_request(RequestId::from_raw(4)));
    }

    #[test]
    fn concurrency_denial_does_not_consume_sampling_budget() {
        let oc = controller(1, 2, Duration::from_secs(1));
        assert!(oc.acquire_request(RequestId::from_raw(1)));
        assert!(!oc.acquire_request(RequestId::from_raw(2)));
        assert_eq!(oc.window_admitted(), 1);
    }

    #[test]
    fn release_without_acquire_clamps_at_zero() {
        let oc = controller(1, 10, Duration::from_secs(1));
        oc.release_request();
        assert_eq!(oc.in_flight(), 0);
        assert!(oc.acquire_request(RequestId::from_raw(1)));
        assert!(!oc.acquire_request(RequestId::from_raw(2)));
    }

    #[test]
    fn quota_is_consumed() {
        let oc = OverheadController::new(&AppsecConfig {
            max_vulnerabilities_per_request: 2,
            ..Default::default()
        });
        let budget = oc.initialize_request_context();
        assert!(oc.has_quota(Operation::ReportVulnerability, &budget));
        assert!(oc.has_quota(Operation::ReportVulnerability, &budget));
        assert!(!oc.has_quota(Operation::ReportVulnerability, &budget));
        assert_eq!(budget.remaining(Operation::ReportVulnerability), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rolls_window_over() {
        let oc = Arc::new(controller(10, 2, Duration::from_millis(100)));
        oc.start_global_context();

        assert!(oc.acquire_request(RequestId::from_raw(1)));
        assert!(oc.acquire_request(RequestId::from_raw(2)));
        assert!(!oc.acquire_request(RequestId::from_raw(3)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(oc.acquire_request(RequestId::from_raw(4)));

        oc.finish_global_context();
        assert!(!oc.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_finish_without_start_is_noop() {
        let oc = Arc::new(controller(1, 1, Duration::from_millis(100)));
        oc.finish_global_context();
        assert!(!oc.is_running());

        oc.start_global_context();
        oc.start_global_context();
        assert!(oc.is_running());

        oc.finish_global_context();
        oc.finish_global_context();
        assert!(!oc.is_running());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release,
        Rollover,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Acquire), Just(Op::Release), Just(Op::Rollover)]
    }

    proptest! {
        #[test]
        fn in_flight_tracks_model(
            max in 1usize..5,
            budget in 1u32..5,
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let oc = controller(max, budget, Duration::from_secs(1));
            let mut model_in_flight = 0usize;
            let mut model_window = 0u32;

            for (i, op) in ops.iter().enumerate() {
                match op {
                    Op::Acquire => {
                        let expected = model_in_flight < max && model_window < budget;
                        let got = oc.acquire_request(RequestId::from_raw(i as u64));
                        prop_assert_eq!(got, expected);
                        if expected {
                            model_in_flight += 1;
                            model_window += 1;
                        }
                    }
                    Op::Release => {
                        oc.release_request();
                        model_in_flight = model_in_flight.saturating_sub(1);
                    }
                    Op::Rollover => {
                        oc.reset_window();
                        model_window = 0;
                    }
                }
                prop_assert_eq!(oc.in_flight(), model_in_flight);
                prop_assert!(oc.in_flight() <= max);
            }
        }
    }
}
