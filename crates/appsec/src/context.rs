//! 요청 컨텍스트와 저장소
//!
//! 분석 대상으로 승인된 요청마다 [`RequestContext`]가 하나 만들어져
//! [`RequestContextStore`]에 요청 ID 키로 저장됩니다. 하나의 요청 처리 흐름 안에서는
//! [`with_request`]로 설정된 태스크 로컬 ID를 통해 [`RequestContextStore::current`]로
//! 컨텍스트를 찾을 수 있습니다.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use reqshield_core::span::TraceSpan;
use reqshield_core::types::{Attributes, RequestId};

use crate::error::AppsecError;
use crate::overhead::RequestBudget;
use crate::vulnerability::{Vulnerability, VulnerabilityBatch};
use crate::waf::{DetectionEngine, WafContext, WafRunResult};

tokio::task_local! {
    static CURRENT_REQUEST: RequestId;
}

/// 요청 ID를 태스크 로컬로 설정한 채 `fut`을 실행합니다.
pub async fn with_request<F: Future>(request_id: RequestId, fut: F) -> F::Output {
    CURRENT_REQUEST.scope(request_id, fut).await
}

/// 현재 태스크에 설정된 요청 ID
pub fn current_request_id() -> Option<RequestId> {
    CURRENT_REQUEST.try_with(|id| *id).ok()
}

/// 승인된 요청 하나의 분석 상태
pub struct RequestContext<E: DetectionEngine> {
    request_id: RequestId,
    span: Arc<dyn TraceSpan>,
    waf: tokio::sync::Mutex<WafContext<E>>,
    vulnerabilities: Mutex<VulnerabilityBatch>,
    budget: RequestBudget,
}

impl<E: DetectionEngine> RequestContext<E> {
    /// 컨텍스트를 생성합니다.
    pub fn new(
        request_id: RequestId,
        span: Arc<dyn TraceSpan>,
        waf: WafContext<E>,
        budget: RequestBudget,
    ) -> Self {
        Self {
            request_id,
            span,
            waf: tokio::sync::Mutex::new(waf),
            vulnerabilities: Mutex::new(VulnerabilityBatch::default()),
            budget,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// 요청의 루트 스팬
    pub fn span(&self) -> &Arc<dyn TraceSpan> {
        &self.span
    }

    /// 요청별 보고 할당량
    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    /// 탐지 엔진을 실행합니다. 같은 요청의 호출은 직렬화됩니다.
    pub async fn run_waf(&self, attributes: &Attributes) -> Option<WafRunResult> {
        self.waf.lock().await.run(attributes).await
    }

    /// 취약점을 기록합니다. 같은 `(kind, location)`은 한 번만 기록됩니다.
    pub fn record_vulnerability(&self, vulnerability: Vulnerability) -> bool {
        self.vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(vulnerability)
    }

    /// 같은 `(kind, location)`이 이미 기록되었는지 여부
    pub fn has_vulnerability(&self, kind: &str, location: &str) -> bool {
        self.vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(kind, location)
    }

    /// 기록된 취약점을 비웁니다. 두 번째 호출부터는 `None`입니다.
    pub fn take_vulnerabilities(&self) -> Option<Vec<Vulnerability>> {
        self.vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// 엔진 컨텍스트를 해제합니다. 여러 번 호출해도 안전합니다.
    pub async fn dispose(&self) {
        self.waf.lock().await.dispose();
    }

    /// 엔진 컨텍스트가 해제되었는지 여부
    pub async fn is_disposed(&self) -> bool {
        self.waf.lock().await.is_disposed()
    }
}

/// 요청 ID -> 컨텍스트 저장소
pub struct RequestContextStore<E: DetectionEngine> {
    contexts: Mutex<HashMap<RequestId, Arc<RequestContext<E>>>>,
}

impl<E: DetectionEngine> RequestContextStore<E> {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// 컨텍스트를 저장합니다.
    ///
    /// 같은 ID가 이미 있으면 기존 컨텍스트를 유지하고 생명주기 위반을 반환합니다.
    pub fn save(
        &self,
        request_id: RequestId,
        context: Arc<RequestContext<E>>,
    ) -> Result<(), AppsecError> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        if contexts.contains_key(&request_id) {
            error!(%request_id, "request context already stored, keeping existing");
            return Err(AppsecError::LifecycleViolation(format!(
                "duplicate request context for {request_id}"
            )));
        }
        contexts.insert(request_id, context);
        Ok(())
    }

    /// 컨텍스트를 조회합니다.
    pub fn get(&self, request_id: RequestId) -> Option<Arc<RequestContext<E>>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request_id)
            .cloned()
    }

    /// `fut`을 `request_id` 요청 범위 안에서 실행합니다.
    pub async fn scope<F: Future>(&self, request_id: RequestId, fut: F) -> F::Output {
        with_request(request_id, fut).await
    }

    /// 현재 태스크의 요청 컨텍스트를 조회합니다.
    pub fn current(&self) -> Option<Arc<RequestContext<E>>> {
        current_request_id().and_then(|id| self.get(id))
    }

    /// 컨텍스트를 제거합니다. 실제로 제거했으면 `true`입니다.
    pub fn clean(&self, request_id: RequestId) -> bool {
        let removed = self
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id)
            .is_some();
        if removed {
            debug!(%request_id, "request context removed");
        }
        removed
    }

    /// 모든 컨텍스트를 꺼냅니다.
    pub fn drain(&self) -> Vec<Arc<RequestContext<E>>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, ctx)| ctx)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: DetectionEngine> Default for RequestContextStore<E> {
    fn default() -> Self {
        Self::new()
    }
}
