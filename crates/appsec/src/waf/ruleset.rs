//! YAML 룰셋 기반 탐지 엔진
//!
//! [`RulesetEngine`]은 [`DetectionEngine`]의 참조 구현입니다.
//! 주소 값에 대한 문자열 조건(exact, contains, starts_with, ends_with, regex)을
//! AND로 결합한 룰을 평가합니다. 정규식은 룰셋 로딩 시 한 번만 컴파일합니다.
//!
//! # YAML 스키마
//! ```yaml
//! version: "1.2.0"
//! rules:
//!   - id: sqli-001
//!     name: SQL injection attempt
//!     tags:
//!       type: sql_injection
//!     conditions:
//!       - address: server.request.query
//!         modifier: contains
//!         value: "' OR 1=1"
//!     on_match: [block]
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use reqshield_core::types::{Action, Attributes};

use super::{DetectionEngine, EngineContext, EngineOutcome};
use crate::config::RulesSource;
use crate::error::AppsecError;

const MAX_RULESET_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB
const MAX_RULES_COUNT: usize = 10_000;
const MAX_RULE_ID_LEN: usize = 256;

/// 주소 값 하나를 평가할 때 순회하는 최대 중첩 깊이
const MAX_VALUE_DEPTH: usize = 20;

/// 룰셋 파일 최상위 구조
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    /// 룰셋 버전
    pub version: String,
    /// 룰 목록
    #[serde(default)]
    pub rules: Vec<WafRule>,
}

/// 탐지 룰
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafRule {
    /// 룰 고유 ID
    pub id: String,
    /// 룰 이름
    #[serde(default)]
    pub name: String,
    /// 룰 상태
    #[serde(default)]
    pub status: RuleStatus,
    /// 분류 태그 (type, category 등)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// 주소 조건 목록 (AND 결합)
    pub conditions: Vec<AddressCondition>,
    /// 매칭 시 요청할 액션
    #[serde(default)]
    pub on_match: Vec<Action>,
}

impl WafRule {
    /// 룰의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), AppsecError> {
        if self.id.is_empty() {
            return Err(rule_error("(empty)", "rule id must not be empty"));
        }
        if self.id.len() > MAX_RULE_ID_LEN {
            return Err(rule_error(
                &self.id,
                &format!("rule id must not exceed {MAX_RULE_ID_LEN} characters"),
            ));
        }
        if self.conditions.is_empty() {
            return Err(rule_error(&self.id, "rule must have at least one condition"));
        }
        if let Some(idx) = self.conditions.iter().position(|c| c.address.is_empty()) {
            return Err(rule_error(
                &self.id,
                &format!("condition[{idx}] has an empty address"),
            ));
        }
        Ok(())
    }
}

/// 룰 상태
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// 활성화 (기본값)
    #[default]
    Enabled,
    /// 비활성화 (주소 집합에도 포함되지 않음)
    Disabled,
}

/// 주소 매칭 조건
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressCondition {
    /// 대상 주소 (예: `server.request.query`)
    pub address: String,
    /// 매칭 수정자
    #[serde(default)]
    pub modifier: ConditionModifier,
    /// 매칭할 값
    pub value: String,
}

/// 조건 수정자 -- 매칭 방식을 결정합니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionModifier {
    /// 정확히 일치
    #[default]
    Exact,
    /// 부분 문자열 포함
    Contains,
    /// 접두사 일치
    StartsWith,
    /// 접미사 일치
    EndsWith,
    /// 정규식 매칭
    Regex,
}

/// 컴파일된 룰셋
#[derive(Debug)]
struct CompiledRuleset {
    version: String,
    rules: Vec<WafRule>,
    /// (rule index, condition index) -> Regex
    regex_cache: HashMap<(usize, usize), Regex>,
    required: HashSet<String>,
}

impl CompiledRuleset {
    fn compile(ruleset: Ruleset) -> Result<Self, AppsecError> {
        if ruleset.rules.len() > MAX_RULES_COUNT {
            return Err(AppsecError::Ruleset {
                source_name: format!("ruleset {}", ruleset.version),
                reason: format!("too many rules: max {MAX_RULES_COUNT}"),
            });
        }

        let mut seen_ids = HashSet::new();
        let mut regex_cache = HashMap::new();
        let mut required = HashSet::new();

        for (rule_idx, rule) in ruleset.rules.iter().enumerate() {
            rule.validate()?;
            if !seen_ids.insert(rule.id.as_str()) {
                return Err(rule_error(&rule.id, "duplicate rule id"));
            }
            if rule.status == RuleStatus::Disabled {
                continue;
            }

            for (cond_idx, condition) in rule.conditions.iter().enumerate() {
                required.insert(condition.address.clone());
                if condition.modifier == ConditionModifier::Regex {
                    let regex = Regex::new(&condition.value).map_err(|e| {
                        rule_error(
                            &rule.id,
                            &format!(
                                "invalid regex in condition[{cond_idx}] for address '{}': {e}",
                                condition.address
                            ),
                        )
                    })?;
                    regex_cache.insert((rule_idx, cond_idx), regex);
                }
            }
        }

        Ok(Self {
            version: ruleset.version,
            rules: ruleset.rules,
            regex_cache,
            required,
        })
    }

    /// 조건 하나를 주소 값에 대해 평가하고, 매칭된 문자열을 반환합니다.
    fn evaluate(
        &self,
        rule_idx: usize,
        cond_idx: usize,
        condition: &AddressCondition,
        value: &Value,
    ) -> Option<String> {
        let mut leaves = Vec::new();
        collect_leaves(value, 0, &mut leaves);

        leaves.into_iter().find(|leaf| match condition.modifier {
            ConditionModifier::Exact => *leaf == condition.value,
            ConditionModifier::Contains => leaf.contains(&condition.value),
            ConditionModifier::StartsWith => leaf.starts_with(&condition.value),
            ConditionModifier::EndsWith => leaf.ends_with(&condition.value),
            ConditionModifier::Regex => self
                .regex_cache
                .get(&(rule_idx, cond_idx))
                .is_some_and(|regex| regex.is_match(leaf)),
        })
    }

    /// 룰의 모든 조건을 평가합니다. 하나라도 실패하면 `None`입니다.
    fn match_rule(&self, rule_idx: usize, inputs: &Attributes) -> Option<Vec<Value>> {
        let rule = &self.rules[rule_idx];
        let mut matches = Vec::with_capacity(rule.conditions.len());

        for (cond_idx, condition) in rule.conditions.iter().enumerate() {
            let value = inputs.get(&condition.address)?;
            let matched = self.evaluate(rule_idx, cond_idx, condition, value)?;
            matches.push(json!({
                "address": condition.address,
                "operator": condition.modifier,
                "value": matched,
            }));
        }

        Some(matches)
    }
}

/// 문자열 리프 값을 수집합니다. 숫자와 불리언은 문자열로 변환합니다.
fn collect_leaves(value: &Value, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_VALUE_DEPTH {
        return;
    }
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                collect_leaves(item, depth + 1, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                out.push(key.clone());
                collect_leaves(item, depth + 1, out);
            }
        }
        Value::Null => {}
    }
}

fn rule_error(rule_id: &str, reason: &str) -> AppsecError {
    AppsecError::RuleValidation {
        rule_id: rule_id.to_owned(),
        reason: reason.to_owned(),
    }
}

/// YAML 룰셋 엔진
#[derive(Debug, Clone)]
pub struct RulesetEngine {
    ruleset: Arc<CompiledRuleset>,
}

impl RulesetEngine {
    /// 룰이 없는 엔진을 생성합니다. 어떤 주소도 소비하지 않습니다.
    pub fn empty() -> Self {
        Self {
            ruleset: Arc::new(CompiledRuleset {
                version: "0.0.0".to_owned(),
                rules: Vec::new(),
                regex_cache: HashMap::new(),
                required: HashSet::new(),
            }),
        }
    }

    /// 파싱된 룰셋을 컴파일합니다.
    pub fn from_ruleset(ruleset: Ruleset) -> Result<Self, AppsecError> {
        let compiled = CompiledRuleset::compile(ruleset)?;
        tracing::info!(
            version = %compiled.version,
            rules = compiled.rules.len(),
            addresses = compiled.required.len(),
            "compiled detection ruleset"
        );
        Ok(Self {
            ruleset: Arc::new(compiled),
        })
    }

    /// YAML 문자열에서 엔진을 생성합니다.
    pub fn from_yaml(yaml: &str, source: &str) -> Result<Self, AppsecError> {
        let ruleset: Ruleset = serde_yaml::from_str(yaml).map_err(|e| AppsecError::Ruleset {
            source_name: source.to_owned(),
            reason: format!("YAML parse error: {e}"),
        })?;
        Self::from_ruleset(ruleset)
    }

    /// YAML 파일에서 엔진을 생성합니다.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self, AppsecError> {
        let path = path.as_ref();
        let source = path.display().to_string();

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| AppsecError::Ruleset {
                source_name: source.clone(),
                reason: format!("failed to read file metadata: {e}"),
            })?;

        if metadata.len() > MAX_RULESET_FILE_SIZE {
            return Err(AppsecError::Ruleset {
                source_name: source,
                reason: format!(
                    "file too large: {} bytes (max: {MAX_RULESET_FILE_SIZE})",
                    metadata.len()
                ),
            });
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppsecError::Ruleset {
                source_name: source.clone(),
                reason: format!("failed to read file: {e}"),
            })?;

        Self::from_yaml(&content, &source)
    }

    /// 설정된 출처에서 엔진을 생성합니다.
    pub async fn from_source(source: &RulesSource) -> Result<Self, AppsecError> {
        match source {
            RulesSource::Empty => Ok(Self::empty()),
            RulesSource::File(path) => Self::load_file(path).await,
            RulesSource::Inline(yaml) => Self::from_yaml(yaml, "inline"),
        }
    }

    /// 활성/비활성 포함 전체 룰 수
    pub fn rule_count(&self) -> usize {
        self.ruleset.rules.len()
    }
}

impl DetectionEngine for RulesetEngine {
    type Context = RulesetContext;

    fn required_addresses(&self) -> &HashSet<String> {
        &self.ruleset.required
    }

    fn rules_version(&self) -> &str {
        &self.ruleset.version
    }

    fn new_context(&self) -> Result<RulesetContext, AppsecError> {
        Ok(RulesetContext {
            ruleset: Some(Arc::clone(&self.ruleset)),
            matched: HashSet::new(),
        })
    }
}

/// 요청별 룰셋 평가 상태
///
/// 같은 요청에서 이미 매칭된 룰은 다시 보고하지 않습니다.
#[derive(Debug)]
pub struct RulesetContext {
    ruleset: Option<Arc<CompiledRuleset>>,
    matched: HashSet<usize>,
}

impl RulesetContext {
    fn evaluate(
        &mut self,
        inputs: &Attributes,
        budget: Duration,
    ) -> Result<EngineOutcome, AppsecError> {
        let ruleset = self
            .ruleset
            .as_ref()
            .ok_or_else(|| AppsecError::EngineFault("ruleset context disposed".to_owned()))?;

        let started = Instant::now();
        let mut outcome = EngineOutcome::default();

        for (rule_idx, rule) in ruleset.rules.iter().enumerate() {
            if started.elapsed() >= budget {
                outcome.timed_out = true;
                break;
            }
            if rule.status == RuleStatus::Disabled || self.matched.contains(&rule_idx) {
                continue;
            }

            if let Some(rule_matches) = ruleset.match_rule(rule_idx, inputs) {
                self.matched.insert(rule_idx);
                outcome.events.push(json!({
                    "rule": {
                        "id": rule.id,
                        "name": rule.name,
                        "tags": rule.tags,
                    },
                    "rule_matches": rule_matches,
                }));
                for action in &rule.on_match {
                    if !outcome.actions.contains(action) {
                        outcome.actions.push(action.clone());
                    }
                }
            }
        }

        outcome.total_runtime = started.elapsed();
        Ok(outcome)
    }
}

impl EngineContext for RulesetContext {
    async fn run(
        &mut self,
        inputs: &Attributes,
        budget: Duration,
    ) -> Result<EngineOutcome, AppsecError> {
        self.evaluate(inputs, budget)
    }

    fn dispose(&mut self) {
        self.ruleset = None;
        self.matched.clear();
    }
}
