//! 보안 분석 파이프라인 오케스트레이션
//!
//! [`SecurityPipeline`]은 서버 알림을 구독하여 요청마다 생명주기 상태 머신을
//! 진행시킵니다.
//!
//! # 내부 아키텍처
//! ```text
//! ServerHooks -> unbounded mpsc -> event loop (FIFO)
//!   start  : OverheadController -> WafContext + TaintTracker -> RequestContextStore -> WAF
//!   error  : counter + span tag
//!   exit   : telemetry
//!   finish : WAF(outbound) -> VulnerabilityReporter -> TaintTracker -> store.clean -> release
//! ```
//!
//! 파이프라인 내부 실패는 요청 응답을 바꾸지 않습니다. 응답에 영향을 주는 것은
//! 탐지 엔진이 요청한 차단 액션뿐입니다.

use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use reqshield_core::config::TelemetryVerbosity;
use reqshield_core::event::SecurityEvent;
use reqshield_core::health::HealthStatus;
use reqshield_core::metrics as m;
use reqshield_core::span::TraceSpan;
use reqshield_core::types::{Attributes, RequestId};

use crate::config::AppsecConfig;
use crate::context::{RequestContext, RequestContextStore};
use crate::error::AppsecError;
use crate::hooks::{Request, RequestEvent, ServerHooks, StartDecision};
use crate::lifecycle::LifecycleState;
use crate::overhead::{Operation, OverheadController};
use crate::tags;
use crate::taint::{TaintOrigin, TaintTracker};
use crate::vulnerability::{Vulnerability, VulnerabilityReporter};
use crate::waf::{DetectionEngine, WafContext, WafRunResult, addresses};

/// 오염 값이 도달할 수 있는 민감한 호출 지점
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sink {
    /// 취약점 종류 (예: `SQL_INJECTION`)
    pub kind: String,
    /// 호출 위치
    pub location: String,
    /// 싱크에 전달된 값
    pub value: String,
}

impl Sink {
    pub fn new(
        kind: impl Into<String>,
        location: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
            value: value.into(),
        }
    }
}

struct Subscription {
    hooks: Arc<ServerHooks>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<E: DetectionEngine> {
    config: AppsecConfig,
    engine: Arc<E>,
    overhead: Arc<OverheadController>,
    store: RequestContextStore<E>,
    taint: TaintTracker,
    reporter: VulnerabilityReporter,
    event_tx: mpsc::Sender<SecurityEvent>,
    subscription: Mutex<Option<Subscription>>,
}

/// 요청 단위 보안 분석 파이프라인
///
/// 복제 비용이 낮은 핸들이며, 모든 복제본은 같은 상태를 공유합니다.
///
/// # 사용 예시
/// ```ignore
/// use reqshield_appsec::{RulesetEngine, SecurityPipelineBuilder, ServerHooks};
///
/// let engine = RulesetEngine::from_source(&config.rules).await?;
/// let (pipeline, event_rx) = SecurityPipelineBuilder::new()
///     .config(config)
///     .engine(engine)
///     .build()?;
///
/// let hooks = Arc::new(ServerHooks::new());
/// pipeline.enable(Arc::clone(&hooks))?;
/// ```
pub struct SecurityPipeline<E: DetectionEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: DetectionEngine> Clone for SecurityPipeline<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: DetectionEngine> SecurityPipeline<E> {
    /// 서버 알림 구독을 시작합니다.
    ///
    /// 같은 `hooks`로 다시 호출하면 아무 일도 하지 않습니다. 다른 구독자가 이미
    /// 슬롯을 점유했거나 다른 `hooks`에 연결되어 있으면 에러를 반환합니다.
    /// tokio 런타임 안에서 호출해야 합니다.
    pub fn enable(&self, hooks: Arc<ServerHooks>) -> Result<(), AppsecError> {
        let mut slot = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = slot.as_ref() {
            if Arc::ptr_eq(&existing.hooks, &hooks) {
                return Ok(());
            }
            return Err(AppsecError::LifecycleViolation(
                "pipeline already enabled on other hooks".to_owned(),
            ));
        }

        let Some(rx) = hooks.subscribe() else {
            return Err(AppsecError::LifecycleViolation(
                "server hooks already have a subscriber".to_owned(),
            ));
        };

        self.inner.overhead.start_global_context();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_event_loop(rx, cancel.clone()));
        *slot = Some(Subscription {
            hooks,
            cancel,
            task,
        });

        info!(
            waf_enabled = self.inner.config.waf_enabled,
            rules_version = self.inner.engine.rules_version(),
            "security pipeline enabled"
        );
        Ok(())
    }

    /// 구독을 해제하고 남은 요청 컨텍스트를 모두 정리합니다.
    ///
    /// 활성화되지 않았으면 아무 일도 하지 않습니다.
    pub async fn disable(&self) {
        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(subscription) = subscription else {
            return;
        };

        subscription.cancel.cancel();
        subscription.hooks.unsubscribe();
        if let Err(e) = subscription.task.await
            && e.is_panic()
        {
            error!(error = %e, "security pipeline event loop panicked");
        }

        let remaining = self.inner.store.drain();
        if !remaining.is_empty() {
            info!(
                count = remaining.len(),
                "releasing request contexts still in flight"
            );
        }
        for ctx in remaining {
            ctx.dispose().await;
            self.inner.taint.remove_transaction(ctx.span().span_id());
            self.inner.overhead.release_request();
        }

        self.inner.overhead.finish_global_context();
        info!("security pipeline disabled");
    }

    /// 구독 중인지 여부
    pub fn is_enabled(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn run_event_loop(
        self,
        mut rx: mpsc::UnboundedReceiver<RequestEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        debug!("server hooks closed, stopping event loop");
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, event: RequestEvent) {
        if self.records(TelemetryVerbosity::Debug) {
            counter!(m::PIPELINE_NOTIFICATIONS_TOTAL, m::LABEL_PHASE => event.kind())
                .increment(1);
        }

        match event {
            RequestEvent::Start {
                request,
                abort,
                reply,
            } => {
                let decision = self.on_request_start(&request).await;
                if decision.is_blocking() {
                    abort.cancel();
                }
                // 호출 측이 이미 사라졌을 수 있음
                let _ = reply.send(decision);
            }
            RequestEvent::Exit { request } => self.on_request_exit(&request),
            RequestEvent::Error { request, error } => self.on_request_error(&request, &error),
            RequestEvent::Finish { request, response } => {
                self.on_request_finish(&request, &response).await;
            }
        }
    }

    /// 요청 시작을 처리합니다.
    ///
    /// 어드미션을 통과하면 컨텍스트를 만들고 입력 주소로 탐지 엔진을 실행합니다.
    /// 결과와 무관하게 루트 스팬에 `appsec.iast.enabled` 태그를 남깁니다.
    pub async fn on_request_start(&self, request: &Arc<Request>) -> StartDecision {
        let request_id = request.id();
        let span = request.span();

        // 늦은 시작과 중복 시작은 샘플링 예산을 쓰지 않음
        if !request
            .state()
            .transition(LifecycleState::Idle, LifecycleState::Admitted)
        {
            warn!(
                %request_id,
                state = %request.state().get(),
                "start notification for a request already started or finalized"
            );
            return StartDecision::default();
        }

        if !self.inner.overhead.acquire_request(request_id) {
            // 그 사이 완료 알림이 정리를 시작했으면 되돌리지 않음
            request
                .state()
                .transition(LifecycleState::Admitted, LifecycleState::Idle);
            tag_span(span.as_ref(), tags::IAST_ENABLED, json!(0));
            return StartDecision::default();
        }

        let ctx = match self.create_context(request) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(%request_id, error = %e, "failed to create request context, skipping analysis");
                self.inner.overhead.release_request();
                tag_span(span.as_ref(), tags::IAST_ENABLED, json!(0));
                return StartDecision::default();
            }
        };

        if let Err(e) = self.inner.store.save(request_id, Arc::clone(&ctx)) {
            warn!(%request_id, error = %e, "discarding request context");
            ctx.dispose().await;
            self.inner.overhead.release_request();
            tag_span(span.as_ref(), tags::IAST_ENABLED, json!(0));
            return StartDecision::default();
        }

        let transaction_id = span.span_id();
        if self.inner.taint.create_transaction(transaction_id, request_id) {
            let tainted = self
                .inner
                .taint
                .taint_request(transaction_id, request.attributes());
            debug!(%request_id, tainted, "request inputs tainted");
        }
        tag_span(span.as_ref(), tags::IAST_ENABLED, json!(1));

        request
            .state()
            .transition(LifecycleState::Admitted, LifecycleState::Analyzing);

        let mut decision = StartDecision {
            analyzed: true,
            actions: Vec::new(),
        };
        if self.inner.config.waf_enabled
            && let Some(result) = ctx.run_waf(request.attributes()).await
        {
            decision.actions = result.actions;
        }

        if decision.is_blocking() {
            counter!(m::WAF_BLOCKS_TOTAL).increment(1);
            info!(%request_id, actions = ?decision.actions, "request blocked");
        }
        decision
    }

    fn create_context(&self, request: &Request) -> Result<Arc<RequestContext<E>>, AppsecError> {
        let waf = WafContext::new(
            Arc::clone(&self.inner.engine),
            request.id(),
            request.span().trace_id().to_string(),
            self.inner.config.waf_timeout,
            self.inner.config.verbosity,
        )?
        .with_event_sender(self.inner.event_tx.clone());

        Ok(Arc::new(RequestContext::new(
            request.id(),
            Arc::clone(request.span()),
            waf,
            self.inner.overhead.initialize_request_context(),
        )))
    }

    /// 핸들러 반환을 처리합니다. 텔레메트리만 남깁니다.
    pub fn on_request_exit(&self, request: &Request) {
        debug!(
            request_id = %request.id(),
            state = %request.state().get(),
            "request handler returned"
        );
    }

    /// 핸들러 실패를 처리합니다. 상태는 바뀌지 않습니다.
    pub fn on_request_error(&self, request: &Request, error: &str) {
        counter!(m::PIPELINE_REQUEST_ERRORS_TOTAL).increment(1);
        warn!(request_id = %request.id(), error, "request failed");
        tag_span(request.span().as_ref(), tags::ERROR, json!(error));
    }

    /// 응답 완료를 처리합니다.
    ///
    /// 요청당 한 번만 정리를 수행하며, 이후 알림은 무시됩니다.
    pub async fn on_request_finish(&self, request: &Request, response: &Attributes) {
        let request_id = request.id();
        let Some(previous) = request.state().begin_finalize() else {
            debug!(%request_id, "request already finalized");
            return;
        };
        if previous == LifecycleState::Idle {
            // 어드미션을 통과하지 못한 요청
            return;
        }

        if let Some(ctx) = self.inner.store.get(request_id) {
            if self.inner.config.waf_enabled && !response.is_empty() {
                ctx.run_waf(response).await;
            }
            if let Some(findings) = ctx.take_vulnerabilities() {
                self.inner
                    .reporter
                    .send_vulnerabilities(request_id, findings, ctx.span().as_ref());
            }
            ctx.dispose().await;
        }

        self.inner
            .taint
            .remove_transaction(request.span().span_id());
        if self.inner.store.clean(request_id) {
            self.inner.overhead.release_request();
        }
        request.state().mark_done();
        debug!(%request_id, "request finalized");
    }

    /// 인증된 사용자를 탐지 엔진에 전달하고 차단 여부를 반환합니다.
    ///
    /// 빈 사용자 ID는 거부합니다. 루트 스팬에 `usr.id` 태그가 없으면 설정합니다.
    pub async fn check_user(&self, request_id: RequestId, user_id: &str) -> bool {
        if user_id.is_empty() {
            warn!(%request_id, "user check with an empty user id, ignoring");
            return false;
        }
        let Some(ctx) = self.inner.store.get(request_id) else {
            warn!(%request_id, "user check without an active request context");
            return false;
        };
        if ctx.span().tag(tags::USER_ID).is_none() {
            tag_span(ctx.span().as_ref(), tags::USER_ID, json!(user_id));
        }
        let mut attributes = Attributes::new();
        attributes.insert(addresses::USER_ID.to_owned(), json!(user_id));
        let blocked = ctx
            .run_waf(&attributes)
            .await
            .is_some_and(|result| result.is_blocking());
        if blocked {
            counter!(m::WAF_BLOCKS_TOTAL).increment(1);
            info!(%request_id, "user blocked");
        }
        blocked
    }

    /// 임의의 주소로 탐지 엔진을 실행합니다.
    pub async fn run_waf(
        &self,
        request_id: RequestId,
        attributes: &Attributes,
    ) -> Option<WafRunResult> {
        let ctx = self.inner.store.get(request_id)?;
        ctx.run_waf(attributes).await
    }

    /// 값을 요청의 오염 출처로 표시합니다.
    pub fn taint_source(&self, request_id: RequestId, value: &str, origin: TaintOrigin) -> bool {
        let Some(ctx) = self.inner.store.get(request_id) else {
            return false;
        };
        self.inner.taint.taint(ctx.span().span_id(), value, origin)
    }

    /// 싱크 호출을 분석합니다.
    ///
    /// 전달된 값이 오염되었고 요청 할당량이 남아 있으면 취약점을 기록하고
    /// `true`를 반환합니다. 이미 기록된 `(kind, location)`은 할당량을 쓰지 않습니다.
    pub fn report_sink(&self, request_id: RequestId, sink: &Sink) -> bool {
        let Some(ctx) = self.inner.store.get(request_id) else {
            return false;
        };
        let Some(origin) = self.inner.taint.origin_of(ctx.span().span_id(), &sink.value) else {
            return false;
        };
        if ctx.has_vulnerability(&sink.kind, &sink.location) {
            return false;
        }
        if !self
            .inner
            .overhead
            .has_quota(Operation::ReportVulnerability, ctx.budget())
        {
            debug!(%request_id, kind = %sink.kind, "vulnerability quota exhausted");
            return false;
        }

        let recorded =
            ctx.record_vulnerability(Vulnerability::new(&sink.kind, &sink.location, &sink.value));
        if recorded {
            debug!(
                %request_id,
                kind = %sink.kind,
                location = %sink.location,
                source_type = %origin.source_type,
                source_name = %origin.name,
                "tainted value reached sink"
            );
        }
        recorded
    }

    /// 파이프라인 상태를 점검합니다.
    pub fn health_check(&self) -> HealthStatus {
        if !self.is_enabled() {
            return HealthStatus::Unhealthy("not enabled".to_owned());
        }
        if !self.inner.overhead.is_running() {
            return HealthStatus::Degraded("sampling window timer not running".to_owned());
        }
        let faults = self.inner.reporter.faults();
        if faults > 0 {
            return HealthStatus::Degraded(format!("{faults} vulnerability reporting faults"));
        }
        HealthStatus::Healthy
    }

    fn records(&self, level: TelemetryVerbosity) -> bool {
        self.inner.config.records(level)
    }

    pub fn config(&self) -> &AppsecConfig {
        &self.inner.config
    }

    /// 탐지 엔진
    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    /// 오버헤드 컨트롤러
    pub fn overhead(&self) -> &Arc<OverheadController> {
        &self.inner.overhead
    }

    /// 요청 컨텍스트 저장소
    pub fn store(&self) -> &RequestContextStore<E> {
        &self.inner.store
    }

    /// 오염 추적기
    pub fn taint(&self) -> &TaintTracker {
        &self.inner.taint
    }

    /// 취약점 보고기
    pub fn reporter(&self) -> &VulnerabilityReporter {
        &self.inner.reporter
    }
}

fn tag_span(span: &dyn TraceSpan, key: &str, value: serde_json::Value) {
    if let Err(e) = span.set_tag(key, value) {
        debug!(key, error = %e, "failed to tag span");
    }
}

/// 보안 분석 파이프라인 빌더
///
/// 파이프라인을 구성하고 보안 이벤트 채널을 생성합니다.
pub struct SecurityPipelineBuilder<E: DetectionEngine> {
    config: AppsecConfig,
    engine: Option<Arc<E>>,
    event_tx: Option<mpsc::Sender<SecurityEvent>>,
}

impl<E: DetectionEngine> SecurityPipelineBuilder<E> {
    pub fn new() -> Self {
        Self {
            config: AppsecConfig::default(),
            engine: None,
            event_tx: None,
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: AppsecConfig) -> Self {
        self.config = config;
        self
    }

    /// 탐지 엔진을 지정합니다.
    pub fn engine(mut self, engine: E) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// 이미 공유 중인 탐지 엔진을 지정합니다.
    pub fn shared_engine(mut self, engine: Arc<E>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// 외부 보안 이벤트 전송 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 생성합니다.
    pub fn event_sender(mut self, tx: mpsc::Sender<SecurityEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 파이프라인을 빌드합니다.
    ///
    /// # Returns
    /// - `SecurityPipeline`: 파이프라인 인스턴스
    /// - `Option<mpsc::Receiver<SecurityEvent>>`: 보안 이벤트 수신 채널
    ///   (외부 event_sender를 설정한 경우 None)
    pub fn build(
        self,
    ) -> Result<(SecurityPipeline<E>, Option<mpsc::Receiver<SecurityEvent>>), AppsecError> {
        self.config.validate()?;

        let engine = self.engine.ok_or_else(|| AppsecError::Config {
            field: "engine".to_owned(),
            reason: "detection engine not set".to_owned(),
        })?;

        let (event_tx, event_rx) = match self.event_tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
                (tx, Some(rx))
            }
        };

        let reporter = VulnerabilityReporter::new(&self.config).with_event_sender(event_tx.clone());
        let overhead = Arc::new(OverheadController::new(&self.config));

        let inner = Inner {
            config: self.config,
            engine,
            overhead,
            store: RequestContextStore::new(),
            taint: TaintTracker::new(),
            reporter,
            event_tx,
            subscription: Mutex::new(None),
        };

        Ok((
            SecurityPipeline {
                inner: Arc::new(inner),
            },
            event_rx,
        ))
    }
}

impl<E: DetectionEngine> Default for SecurityPipelineBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
