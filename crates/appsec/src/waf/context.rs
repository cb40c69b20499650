//! 요청 단위 탐지 엔진 핸들
//!
//! [`WafContext`]는 허용된 요청 하나에 대해 한 번 생성되고 정확히 한 번 해제됩니다.
//!
//! # 호출 흐름
//! 1. 입력 주소 맵을 룰셋이 소비하는 주소로 필터링 (비어 있으면 엔진 호출 생략)
//! 2. `tokio::time::timeout`으로 감싼 엔진 호출 (엔진 예산 + [`TIMEOUT_GRACE`])
//! 3. 엔진 보고 시간(`duration`)과 호출 측 관측 시간(`duration_ext`) 메트릭 기록
//! 4. 매칭 결과가 있으면 [`AttackEvent`] 발행 후 액션 반환
//!
//! 엔진 실패는 로그로 남기고 `None`을 반환합니다 (fail open).

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use reqshield_core::config::TelemetryVerbosity;
use reqshield_core::event::{AttackEvent, SecurityEvent};
use reqshield_core::metrics as m;
use reqshield_core::types::{Action, Attributes, RequestId};

use super::{DetectionEngine, EngineContext, EngineOutcome};
use crate::error::AppsecError;
use crate::events::try_publish;

/// 엔진이 예산 경계에서 돌려준 부분 결과를 받기 위한 바깥 타이머 여유
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(1);

/// 엔진 호출 1회의 결과
#[derive(Debug, Clone, PartialEq)]
pub struct WafRunResult {
    /// 요청된 완화 액션
    pub actions: Vec<Action>,
    /// 매칭 결과
    pub events: Vec<serde_json::Value>,
    /// 예산 초과로 부분 결과만 얻었는지 여부
    pub timed_out: bool,
    /// 엔진이 보고한 실행 시간
    pub duration: Duration,
    /// 호출 측이 관측한 실행 시간
    pub duration_ext: Duration,
    /// 룰셋 버전
    pub rules_version: String,
}

impl WafRunResult {
    /// 공격이 관측되었는지 여부
    pub fn is_attack(&self) -> bool {
        !self.events.is_empty()
    }

    /// 요청을 종료시키는 액션이 있는지 여부
    pub fn is_blocking(&self) -> bool {
        self.actions.iter().any(Action::is_blocking)
    }
}

/// 요청 하나에 대한 탐지 엔진 핸들
pub struct WafContext<E: DetectionEngine> {
    engine: Arc<E>,
    inner: E::Context,
    request_id: RequestId,
    trace_id: String,
    timeout: Duration,
    verbosity: TelemetryVerbosity,
    event_tx: Option<mpsc::Sender<SecurityEvent>>,
    disposed: bool,
}

impl<E: DetectionEngine> WafContext<E> {
    /// 엔진에서 요청별 컨텍스트를 만들어 핸들을 생성합니다.
    pub fn new(
        engine: Arc<E>,
        request_id: RequestId,
        trace_id: impl Into<String>,
        timeout: Duration,
        verbosity: TelemetryVerbosity,
    ) -> Result<Self, AppsecError> {
        let inner = engine.new_context()?;
        Ok(Self {
            engine,
            inner,
            request_id,
            trace_id: trace_id.into(),
            timeout,
            verbosity,
            event_tx: None,
            disposed: false,
        })
    }

    /// 공격 이벤트를 전송할 채널을 설정합니다.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<SecurityEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 대상 요청 ID
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// 해제되었는지 여부
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 주소 맵에 대해 엔진을 실행합니다.
    ///
    /// 필요한 주소가 하나도 없거나, 엔진이 실패했거나, 이미 해제된
    /// 핸들이면 `None`을 반환합니다. 타임아웃은 에러가 아니며
    /// `timed_out = true`인 결과로 반환됩니다.
    pub async fn run(&mut self, attributes: &Attributes) -> Option<WafRunResult> {
        if self.disposed {
            debug_assert!(!self.disposed, "WafContext::run called after dispose");
            error!(
                request_id = %self.request_id,
                "detection engine invoked after dispose, ignoring"
            );
            return None;
        }

        let required = self.engine.required_addresses();
        let inputs: Attributes = attributes
            .iter()
            .filter(|(address, _)| required.contains(address.as_str()))
            .map(|(address, value)| (address.clone(), value.clone()))
            .collect();

        if inputs.is_empty() {
            if self.records(TelemetryVerbosity::Debug) {
                counter!(m::WAF_RUNS_SKIPPED_TOTAL).increment(1);
            }
            return None;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout + TIMEOUT_GRACE,
            self.inner.run(&inputs, self.timeout),
        )
        .await;
        let duration_ext = started.elapsed();

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                counter!(m::WAF_ERRORS_TOTAL).increment(1);
                warn!(
                    request_id = %self.request_id,
                    error = %e,
                    "detection engine failed, continuing without analysis"
                );
                return None;
            }
            Err(_) => {
                debug!(
                    request_id = %self.request_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "detection engine exceeded its budget"
                );
                EngineOutcome {
                    total_runtime: duration_ext,
                    timed_out: true,
                    ..Default::default()
                }
            }
        };

        let result = WafRunResult {
            actions: outcome.actions,
            events: outcome.events,
            timed_out: outcome.timed_out,
            duration: outcome.total_runtime,
            duration_ext,
            rules_version: self.engine.rules_version().to_owned(),
        };

        self.record_metrics(&result);

        if result.is_attack() {
            self.report_attack(&result);
        }

        Some(result)
    }

    /// 엔진 측 컨텍스트를 해제합니다. 여러 번 호출해도 안전합니다.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.inner.dispose();
        self.disposed = true;
    }

    fn records(&self, level: TelemetryVerbosity) -> bool {
        self.verbosity >= level && level > TelemetryVerbosity::Off
    }

    fn record_metrics(&self, result: &WafRunResult) {
        if self.records(TelemetryVerbosity::Mandatory) {
            counter!(
                m::WAF_RUNS_TOTAL,
                m::LABEL_RULES_VERSION => result.rules_version.clone()
            )
            .increment(1);
            if result.timed_out {
                counter!(m::WAF_TIMEOUTS_TOTAL).increment(1);
            }
        }
        if self.records(TelemetryVerbosity::Information) {
            histogram!(m::WAF_DURATION_SECONDS).record(result.duration.as_secs_f64());
            histogram!(m::WAF_DURATION_EXT_SECONDS).record(result.duration_ext.as_secs_f64());
        }
    }

    fn report_attack(&self, result: &WafRunResult) {
        counter!(m::WAF_ATTACKS_TOTAL).increment(1);
        debug!(
            request_id = %self.request_id,
            matches = result.events.len(),
            blocking = result.is_blocking(),
            "attack observed"
        );

        if let Some(tx) = &self.event_tx {
            let event = AttackEvent::new(
                self.request_id,
                self.trace_id.clone(),
                result.rules_version.clone(),
                serde_json::Value::Array(result.events.clone()),
                result.actions.clone(),
            );
            try_publish(tx, SecurityEvent::Attack(event));
        }
    }
}

impl<E: DetectionEngine> Drop for WafContext<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}
