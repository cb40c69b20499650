//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `reqshield_`
//! - 모듈명: `waf_`, `overhead_`, `iast_`, `pipeline_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(reqshield_core::metrics::WAF_RUNS_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 룰셋 버전 레이블 키
pub const LABEL_RULES_VERSION: &str = "rules_version";

/// 어드미션 거부 사유 레이블 키 (concurrency, sampling)
pub const LABEL_REASON: &str = "reason";

/// 취약점 종류 레이블 키
pub const LABEL_KIND: &str = "kind";

/// 라이프사이클 알림 레이블 키 (start, exit, error, finish)
pub const LABEL_PHASE: &str = "phase";

// ─── WAF 메트릭 ─────────────────────────────────────────────────────

/// WAF: 엔진 호출 수 (counter, label: rules_version)
pub const WAF_RUNS_TOTAL: &str = "reqshield_waf_runs_total";

/// WAF: 필수 주소가 없어 생략된 호출 수 (counter)
pub const WAF_RUNS_SKIPPED_TOTAL: &str = "reqshield_waf_runs_skipped_total";

/// WAF: 타임아웃 발생 수 (counter)
pub const WAF_TIMEOUTS_TOTAL: &str = "reqshield_waf_timeouts_total";

/// WAF: 엔진 오류 수 (counter)
pub const WAF_ERRORS_TOTAL: &str = "reqshield_waf_errors_total";

/// WAF: 공격 탐지 수 (counter)
pub const WAF_ATTACKS_TOTAL: &str = "reqshield_waf_attacks_total";

/// WAF: 차단 결정 수 (counter)
pub const WAF_BLOCKS_TOTAL: &str = "reqshield_waf_blocks_total";

/// WAF: 엔진이 보고한 실행 시간 (histogram, 초)
pub const WAF_DURATION_SECONDS: &str = "reqshield_waf_duration_seconds";

/// WAF: 호출 측이 관측한 실행 시간 (histogram, 초)
pub const WAF_DURATION_EXT_SECONDS: &str = "reqshield_waf_duration_ext_seconds";

// ─── Overhead 메트릭 ────────────────────────────────────────────────

/// Overhead: 분석이 허용된 요청 수 (counter)
pub const OVERHEAD_ADMITTED_TOTAL: &str = "reqshield_overhead_admitted_total";

/// Overhead: 분석이 거부된 요청 수 (counter, label: reason)
pub const OVERHEAD_DENIED_TOTAL: &str = "reqshield_overhead_denied_total";

/// Overhead: 현재 분석 중인 요청 수 (gauge)
pub const OVERHEAD_IN_FLIGHT: &str = "reqshield_overhead_in_flight";

/// Overhead: 라이프사이클 위반 수 (counter)
pub const OVERHEAD_LIFECYCLE_VIOLATIONS_TOTAL: &str =
    "reqshield_overhead_lifecycle_violations_total";

// ─── IAST 메트릭 ────────────────────────────────────────────────────

/// IAST: 보고된 취약점 수 (counter, label: kind)
pub const IAST_VULNERABILITIES_REPORTED_TOTAL: &str =
    "reqshield_iast_vulnerabilities_reported_total";

/// IAST: 중복으로 억제된 취약점 수 (counter)
pub const IAST_VULNERABILITIES_SUPPRESSED_TOTAL: &str =
    "reqshield_iast_vulnerabilities_suppressed_total";

/// IAST: 보고 실패 수 (counter)
pub const IAST_REPORTING_FAULTS_TOTAL: &str = "reqshield_iast_reporting_faults_total";

/// IAST: 열린 taint 트랜잭션 수 (gauge)
pub const IAST_TAINT_TRANSACTIONS: &str = "reqshield_iast_taint_transactions";

// ─── Pipeline 메트릭 ────────────────────────────────────────────────

/// Pipeline: 처리된 라이프사이클 알림 수 (counter, label: phase)
pub const PIPELINE_NOTIFICATIONS_TOTAL: &str = "reqshield_pipeline_notifications_total";

/// Pipeline: 핸들러 오류 수 (counter)
pub const PIPELINE_REQUEST_ERRORS_TOTAL: &str = "reqshield_pipeline_request_errors_total";

/// Pipeline: 채널이 가득 차서 버려진 보안 이벤트 수 (counter)
pub const PIPELINE_EVENTS_DROPPED_TOTAL: &str = "reqshield_pipeline_events_dropped_total";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "reqshield_daemon_uptime_seconds";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "reqshield_daemon_build_info";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 엔진 호출 시간 히스토그램 버킷 (초)
///
/// 10us ~ 100ms 범위. 기본 타임아웃(5ms) 주변을 촘촘하게 나눕니다.
pub const WAF_DURATION_BUCKETS: [f64; 10] = [
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1,
];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 이 함수는 전역 레코더 설치 후 한 번만 호출해야 합니다.
/// 일반적으로 `reqshield-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // WAF
    describe_counter!(WAF_RUNS_TOTAL, "Total number of detection engine invocations");
    describe_counter!(
        WAF_RUNS_SKIPPED_TOTAL,
        "Engine runs skipped because no required address was present"
    );
    describe_counter!(
        WAF_TIMEOUTS_TOTAL,
        "Engine runs that hit the configured timeout"
    );
    describe_counter!(
        WAF_ERRORS_TOTAL,
        "Engine runs that failed and were ignored (fail open)"
    );
    describe_counter!(WAF_ATTACKS_TOTAL, "Engine runs that reported an attack");
    describe_counter!(
        WAF_BLOCKS_TOTAL,
        "Requests for which the engine requested a blocking action"
    );
    describe_histogram!(
        WAF_DURATION_SECONDS,
        "Engine-reported runtime of a single run in seconds"
    );
    describe_histogram!(
        WAF_DURATION_EXT_SECONDS,
        "Caller-observed wall time of a single engine run in seconds"
    );

    // Overhead
    describe_counter!(
        OVERHEAD_ADMITTED_TOTAL,
        "Requests admitted to deep analysis"
    );
    describe_counter!(
        OVERHEAD_DENIED_TOTAL,
        "Requests denied deep analysis, by gate"
    );
    describe_gauge!(
        OVERHEAD_IN_FLIGHT,
        "Requests currently under deep analysis"
    );
    describe_counter!(
        OVERHEAD_LIFECYCLE_VIOLATIONS_TOTAL,
        "Admission bookkeeping violations (release without acquire)"
    );

    // IAST
    describe_counter!(
        IAST_VULNERABILITIES_REPORTED_TOTAL,
        "Vulnerabilities attached to request spans"
    );
    describe_counter!(
        IAST_VULNERABILITIES_SUPPRESSED_TOTAL,
        "Vulnerabilities suppressed as duplicates"
    );
    describe_counter!(
        IAST_REPORTING_FAULTS_TOTAL,
        "Vulnerability flushes that failed and were discarded"
    );
    describe_gauge!(
        IAST_TAINT_TRANSACTIONS,
        "Open taint tracking transactions"
    );

    // Pipeline
    describe_counter!(
        PIPELINE_NOTIFICATIONS_TOTAL,
        "Request lifecycle notifications processed, by phase"
    );
    describe_counter!(
        PIPELINE_REQUEST_ERRORS_TOTAL,
        "Handler errors forwarded to the reporting path"
    );
    describe_counter!(
        PIPELINE_EVENTS_DROPPED_TOTAL,
        "Security events dropped because the downstream channel was full"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "reqshield daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}
