//! 다운스트림 보안 이벤트 전송

use metrics::counter;
use tokio::sync::mpsc;
use tracing::warn;

use reqshield_core::event::{Event, SecurityEvent};
use reqshield_core::metrics as m;

/// 이벤트를 비동기 대기 없이 전송합니다.
///
/// 채널이 가득 찼거나 수신 측이 사라졌으면 이벤트를 버리고 `false`를 반환합니다.
/// 분석 결과 전송 실패는 요청 처리에 영향을 주지 않습니다.
pub(crate) fn try_publish(tx: &mpsc::Sender<SecurityEvent>, event: SecurityEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            counter!(m::PIPELINE_EVENTS_DROPPED_TOTAL).increment(1);
            warn!(
                event_id = %event.as_event().event_id(),
                event_type = event.as_event().event_type(),
                "security event channel full, dropping event"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            counter!(m::PIPELINE_EVENTS_DROPPED_TOTAL).increment(1);
            warn!(
                event_id = %event.as_event().event_id(),
                "security event receiver dropped, discarding event"
            );
            false
        }
    }
}
