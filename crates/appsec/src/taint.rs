//! 오염(taint) 추적 트랜잭션
//!
//! 요청마다 루트 스팬 ID로 식별되는 트랜잭션을 하나 열고, 신뢰할 수 없는 입력
//! 값을 출처와 함께 기록합니다. 싱크 호출 시 [`TaintTracker::is_tainted`]로 인자에
//! 오염된 값이 포함되었는지 확인합니다.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::gauge;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use reqshield_core::metrics as m;
use reqshield_core::types::{Attributes, RequestId};

use crate::waf::addresses;

/// 트랜잭션 하나가 보관하는 최대 오염 값 수
pub const MAX_TAINTED_VALUES: usize = 1_024;

/// 요청 입력 순회 최대 깊이
const MAX_WALK_DEPTH: usize = 20;

/// 오염 값의 출처
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaintOrigin {
    /// 출처 종류 (예: `http.request.parameter`)
    pub source_type: String,
    /// 출처 이름 (파라미터/헤더 이름)
    pub name: String,
}

impl TaintOrigin {
    /// 출처를 생성합니다.
    pub fn new(source_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug)]
struct Transaction {
    request_id: RequestId,
    values: HashMap<String, TaintOrigin>,
}

/// 오염 추적기
#[derive(Debug, Default)]
pub struct TaintTracker {
    transactions: Mutex<HashMap<u64, Transaction>>,
}

impl TaintTracker {
    /// 빈 추적기를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 트랜잭션을 엽니다. 같은 ID가 이미 열려 있으면 `false`입니다.
    pub fn create_transaction(&self, transaction_id: u64, request_id: RequestId) -> bool {
        let mut txs = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        if txs.contains_key(&transaction_id) {
            warn!(transaction_id, %request_id, "taint transaction already open");
            return false;
        }
        txs.insert(
            transaction_id,
            Transaction {
                request_id,
                values: HashMap::new(),
            },
        );
        gauge!(m::IAST_TAINT_TRANSACTIONS).set(txs.len() as f64);
        true
    }

    /// 트랜잭션을 닫습니다. 열려 있지 않았으면 `false`입니다.
    pub fn remove_transaction(&self, transaction_id: u64) -> bool {
        let mut txs = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        let removed = txs.remove(&transaction_id);
        gauge!(m::IAST_TAINT_TRANSACTIONS).set(txs.len() as f64);
        if let Some(tx) = &removed {
            debug!(
                transaction_id,
                request_id = %tx.request_id,
                tainted = tx.values.len(),
                "taint transaction closed"
            );
        }
        removed.is_some()
    }

    /// 값을 오염으로 표시합니다.
    ///
    /// 빈 값, 닫힌 트랜잭션, 용량 초과는 무시하고 `false`를 반환합니다.
    pub fn taint(&self, transaction_id: u64, value: &str, origin: TaintOrigin) -> bool {
        if value.is_empty() {
            return false;
        }
        let mut txs = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = txs.get_mut(&transaction_id) else {
            return false;
        };
        if tx.values.len() >= MAX_TAINTED_VALUES && !tx.values.contains_key(value) {
            debug!(transaction_id, "taint capacity reached");
            return false;
        }
        tx.values.entry(value.to_owned()).or_insert(origin);
        true
    }

    /// `candidate`가 오염된 값을 포함하는지 확인합니다.
    pub fn is_tainted(&self, transaction_id: u64, candidate: &str) -> bool {
        self.origin_of(transaction_id, candidate).is_some()
    }

    /// `candidate`에 포함된 오염 값의 출처를 반환합니다.
    pub fn origin_of(&self, transaction_id: u64, candidate: &str) -> Option<TaintOrigin> {
        let txs = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        let tx = txs.get(&transaction_id)?;
        tx.values
            .iter()
            .find(|(value, _)| candidate.contains(value.as_str()))
            .map(|(_, origin)| origin.clone())
    }

    /// 요청 입력(쿼리, 본문, 헤더, URI)의 문자열 값을 모두 오염으로 표시합니다.
    ///
    /// 표시된 값의 수를 반환합니다.
    pub fn taint_request(&self, transaction_id: u64, attributes: &Attributes) -> usize {
        let sources = [
            (addresses::REQUEST_QUERY, "http.request.parameter"),
            (addresses::REQUEST_BODY, "http.request.body"),
            (addresses::REQUEST_HEADERS_NO_COOKIES, "http.request.header"),
            (addresses::REQUEST_URI_RAW, "http.request.uri"),
        ];

        let mut tainted = 0;
        for (address, source_type) in sources {
            let Some(value) = attributes.get(address) else {
                continue;
            };
            let mut leaves = Vec::new();
            collect_named_leaves(value, address, 0, &mut leaves);
            for (name, leaf) in leaves {
                if self.taint(transaction_id, &leaf, TaintOrigin::new(source_type, name)) {
                    tainted += 1;
                }
            }
        }
        tainted
    }

    /// 열린 트랜잭션 수
    pub fn transaction_count(&self) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// 트랜잭션의 오염 값 수
    pub fn tainted_count(&self, transaction_id: u64) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&transaction_id)
            .map_or(0, |tx| tx.values.len())
    }
}

/// 문자열 잎 노드를 가장 가까운 키 이름과 함께 모읍니다.
fn collect_named_leaves(value: &Value, name: &str, depth: usize, out: &mut Vec<(String, String)>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    match value {
        Value::String(s) => out.push((name.to_owned(), s.clone())),
        Value::Array(items) => {
            for item in items {
                collect_named_leaves(item, name, depth + 1, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_named_leaves(item, key, depth + 1, out);
            }
        }
        _ => {}
    }
}
