//! 통합 테스트 공용 도구

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use reqshield_appsec::waf::addresses;
use reqshield_appsec::{
    AppsecConfig, AppsecError, DetectionEngine, EngineContext, EngineOutcome, Request,
    SecurityPipeline, SecurityPipelineBuilder,
};
use reqshield_core::event::SecurityEvent;
use reqshield_core::span::RecordingSpan;
use reqshield_core::types::{Action, Attributes};
use tokio::sync::mpsc;

/// 호출 횟수를 기록하는 탐지 엔진
pub struct CountingEngine {
    required: HashSet<String>,
    pub calls: Arc<AtomicUsize>,
    pub disposals: Arc<AtomicUsize>,
    pub delay: Duration,
    /// 입력 문자열에 포함되면 차단하는 패턴
    pub block_on: Option<String>,
}

impl CountingEngine {
    pub fn new(required: &[&str]) -> Self {
        Self {
            required: required.iter().map(|s| (*s).to_owned()).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
            disposals: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            block_on: None,
        }
    }

    pub fn blocking(required: &[&str], pattern: &str) -> Self {
        Self {
            block_on: Some(pattern.to_owned()),
            ..Self::new(required)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct CountingContext {
    calls: Arc<AtomicUsize>,
    disposals: Arc<AtomicUsize>,
    delay: Duration,
    block_on: Option<String>,
}

impl EngineContext for CountingContext {
    async fn run(
        &mut self,
        inputs: &Attributes,
        _budget: Duration,
    ) -> Result<EngineOutcome, AppsecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut outcome = EngineOutcome {
            total_runtime: Duration::from_micros(10),
            ..Default::default()
        };
        if let Some(pattern) = &self.block_on
            && inputs.values().any(|v| contains(v, pattern))
        {
            outcome.events.push(json!({"rule": {"id": "counting-block"}}));
            outcome.actions.push(Action::Block);
        }
        Ok(outcome)
    }

    fn dispose(&mut self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

fn contains(value: &Value, pattern: &str) -> bool {
    match value {
        Value::String(s) => s.contains(pattern),
        Value::Array(items) => items.iter().any(|v| contains(v, pattern)),
        Value::Object(map) => map.values().any(|v| contains(v, pattern)),
        _ => false,
    }
}

impl DetectionEngine for CountingEngine {
    type Context = CountingContext;

    fn required_addresses(&self) -> &HashSet<String> {
        &self.required
    }

    fn rules_version(&self) -> &str {
        "counting-1"
    }

    fn new_context(&self) -> Result<CountingContext, AppsecError> {
        Ok(CountingContext {
            calls: Arc::clone(&self.calls),
            disposals: Arc::clone(&self.disposals),
            delay: self.delay,
            block_on: self.block_on.clone(),
        })
    }
}

/// 넉넉한 예산의 테스트 설정
pub fn config() -> AppsecConfig {
    AppsecConfig {
        max_concurrent_requests: 16,
        sampling_budget: 1_000,
        dedup_window: Duration::ZERO,
        max_vulnerabilities_per_request: 8,
        ..Default::default()
    }
}

pub fn pipeline(
    config: AppsecConfig,
    engine: CountingEngine,
) -> (
    SecurityPipeline<CountingEngine>,
    mpsc::Receiver<SecurityEvent>,
) {
    let (pipeline, rx) = SecurityPipelineBuilder::new()
        .config(config)
        .engine(engine)
        .build()
        .expect("pipeline builds");
    (pipeline, rx.expect("internal event channel"))
}

/// 쿼리 입력을 가진 요청
pub fn request(query: Value) -> Arc<Request> {
    let mut attrs = Attributes::new();
    attrs.insert(addresses::REQUEST_QUERY.to_owned(), query);
    Request::new(attrs, Arc::new(RecordingSpan::new_root()))
}

/// 조건이 참이 될 때까지 기다립니다.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
