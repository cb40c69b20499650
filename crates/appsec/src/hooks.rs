//! 서버 진입점 알림 인터페이스
//!
//! 서버 연동 코드는 [`ServerHooks`]를 통해 요청 시작/종료/에러/완료 알림을
//! 발행합니다. 구독자는 최대 하나이며 (보통 [`crate::SecurityPipeline`]),
//! 구독자가 없으면 발행은 아무 일도 하지 않습니다.
//!
//! # 사용 예시
//! ```ignore
//! let request = Request::new(attributes, span);
//! let outcome = hooks
//!     .handle_request(Arc::clone(&request), |abort| async move {
//!         serve(abort).await
//!     })
//!     .await;
//! if let HandlerOutcome::Completed(response) = outcome {
//!     hooks.finish_response(&request, response.attributes());
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use reqshield_core::span::TraceSpan;
use reqshield_core::types::{Action, Attributes, RequestId};

use crate::context::with_request;
use crate::lifecycle::LifecycleCell;
use crate::waf::addresses;

/// 진행 중인 요청 하나
pub struct Request {
    id: RequestId,
    attributes: Attributes,
    span: Arc<dyn TraceSpan>,
    state: LifecycleCell,
    finished: AtomicBool,
}

impl Request {
    /// 새 요청 ID로 요청을 생성합니다.
    pub fn new(attributes: Attributes, span: Arc<dyn TraceSpan>) -> Arc<Self> {
        Self::with_id(RequestId::next(), attributes, span)
    }

    /// 주어진 요청 ID로 요청을 생성합니다.
    pub fn with_id(id: RequestId, attributes: Attributes, span: Arc<dyn TraceSpan>) -> Arc<Self> {
        Arc::new(Self {
            id,
            attributes,
            span,
            state: LifecycleCell::new(),
            finished: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// 요청 입력 주소 맵
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// 요청의 루트 스팬
    pub fn span(&self) -> &Arc<dyn TraceSpan> {
        &self.span
    }

    /// 생명주기 상태
    pub fn state(&self) -> &LifecycleCell {
        &self.state
    }

    /// 완료 알림이 이미 발행되었는지 여부
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// 요청 시작 처리 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartDecision {
    /// 심층 분석 대상으로 승인되었는지 여부
    pub analyzed: bool,
    /// 탐지 엔진이 요청한 액션
    pub actions: Vec<Action>,
}

impl StartDecision {
    /// 요청을 종료시키는 액션이 있는지 여부
    pub fn is_blocking(&self) -> bool {
        self.actions.iter().any(Action::is_blocking)
    }
}

/// 서버 알림
#[derive(Debug)]
pub enum RequestEvent {
    /// 요청 시작. 구독자는 `reply`로 결정을 돌려주고, 차단 시 `abort`를 취소합니다.
    Start {
        request: Arc<Request>,
        abort: CancellationToken,
        reply: oneshot::Sender<StartDecision>,
    },
    /// 핸들러 반환
    Exit { request: Arc<Request> },
    /// 핸들러 실패
    Error { request: Arc<Request>, error: String },
    /// 응답 완료
    Finish {
        request: Arc<Request>,
        response: Attributes,
    },
}

impl RequestEvent {
    /// 알림 종류 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
            Self::Finish { .. } => "finish",
        }
    }
}

/// 요청 핸들러 실행 결과
#[derive(Debug)]
pub enum HandlerOutcome<T, E> {
    /// 핸들러가 성공함. 호출 측이 [`ServerHooks::finish_response`]를 호출해야 합니다.
    Completed(T),
    /// 핸들러가 실패함. 완료 알림은 이미 발행되었습니다.
    Failed(E),
    /// 핸들러 실행 전에 차단됨. 완료 알림은 이미 발행되었습니다.
    Aborted { actions: Vec<Action> },
}

/// 서버 알림 발행기
#[derive(Default)]
pub struct ServerHooks {
    subscriber: Mutex<Option<mpsc::UnboundedSender<RequestEvent>>>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 알림을 구독합니다. 살아 있는 구독자가 이미 있으면 `None`입니다.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<RequestEvent>> {
        let mut slot = self.subscriber.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        debug!("server hooks subscribed");
        Some(rx)
    }

    /// 구독을 해제합니다.
    pub fn unsubscribe(&self) {
        let previous = self
            .subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if previous.is_some() {
            debug!("server hooks unsubscribed");
        }
    }

    /// 살아 있는 구독자가 있는지 여부
    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn publish(&self, event: RequestEvent) -> bool {
        let sender = self
            .subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sender {
            Some(tx) => match tx.send(event) {
                Ok(()) => true,
                Err(mpsc::error::SendError(event)) => {
                    debug!(kind = event.kind(), "subscriber gone, notification dropped");
                    false
                }
            },
            None => false,
        }
    }

    /// 시작 알림을 발행하고 구독자의 결정을 기다립니다.
    ///
    /// 구독자가 없거나 응답 없이 사라지면 기본 결정(분석 안 함)을 반환합니다.
    pub async fn publish_start(
        &self,
        request: &Arc<Request>,
        abort: &CancellationToken,
    ) -> StartDecision {
        let (reply, decision) = oneshot::channel();
        let published = self.publish(RequestEvent::Start {
            request: Arc::clone(request),
            abort: abort.clone(),
            reply,
        });
        if !published {
            return StartDecision::default();
        }
        decision.await.unwrap_or_default()
    }

    /// 핸들러 반환 알림을 발행합니다.
    pub fn publish_exit(&self, request: &Arc<Request>) {
        self.publish(RequestEvent::Exit {
            request: Arc::clone(request),
        });
    }

    /// 핸들러 실패 알림을 발행합니다.
    pub fn publish_error(&self, request: &Arc<Request>, error: impl fmt::Display) {
        self.publish(RequestEvent::Error {
            request: Arc::clone(request),
            error: error.to_string(),
        });
    }

    /// 응답 완료 알림을 발행합니다.
    ///
    /// `finish`와 `close` 양쪽에서 호출될 수 있으며, 요청당 처음 한 번만 발행하고
    /// `true`를 반환합니다.
    pub fn finish_response(&self, request: &Arc<Request>, response: Attributes) -> bool {
        if request.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.publish(RequestEvent::Finish {
            request: Arc::clone(request),
            response,
        });
        true
    }

    /// 요청 핸들러를 감싸 실행합니다.
    ///
    /// 1. 시작 알림을 발행하고 결정을 기다립니다.
    /// 2. 중단 토큰이 취소되었으면 핸들러를 실행하지 않고 403 응답으로 완료합니다.
    /// 3. 핸들러는 요청 ID가 태스크 로컬로 설정된 범위 안에서 실행되며,
    ///    실패하면 에러 알림을 발행합니다.
    /// 4. 반환 알림은 항상 발행합니다. 실패한 요청은 500 응답으로 완료합니다.
    ///
    /// 반환 전에 future가 drop되면 빈 응답으로 완료 알림을 발행합니다.
    pub async fn handle_request<T, E, F, Fut>(
        &self,
        request: Arc<Request>,
        handler: F,
    ) -> HandlerOutcome<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut guard = FinishGuard {
            hooks: self,
            request: Arc::clone(&request),
            armed: true,
        };

        let abort = CancellationToken::new();
        let decision = self.publish_start(&request, &abort).await;

        if abort.is_cancelled() || decision.is_blocking() {
            debug!(request_id = %request.id(), "request aborted before handler");
            self.publish_exit(&request);
            guard.armed = false;
            self.finish_response(&request, status_response(403));
            return HandlerOutcome::Aborted {
                actions: decision.actions,
            };
        }

        let result = with_request(request.id(), handler(abort)).await;
        if let Err(e) = &result {
            warn!(request_id = %request.id(), error = %e, "request handler failed");
            self.publish_error(&request, e);
        }
        self.publish_exit(&request);
        guard.armed = false;

        match result {
            Ok(value) => HandlerOutcome::Completed(value),
            Err(e) => {
                self.finish_response(&request, status_response(500));
                HandlerOutcome::Failed(e)
            }
        }
    }
}

/// `server.response.status`만 담은 응답 주소 맵
pub fn status_response(status: u16) -> Attributes {
    let mut response = Attributes::new();
    response.insert(addresses::RESPONSE_STATUS.to_owned(), json!(status));
    response
}

/// future가 중간에 drop되어도 완료 알림을 보장합니다.
struct FinishGuard<'a> {
    hooks: &'a ServerHooks,
    request: Arc<Request>,
    armed: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(request_id = %self.request.id(), "request future dropped, finishing");
            self.hooks.finish_response(&self.request, Attributes::new());
        }
    }
}
