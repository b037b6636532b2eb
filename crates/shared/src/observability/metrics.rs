//! 指标定义
//!
//! 基于 metrics 门面记录指标。本模块只负责指标命名和描述，
//! 导出器（Prometheus 等）由宿主应用自行安装；未安装 recorder 时所有记录均为空操作。

/// 规则评估次数
pub const RULE_EVALUATIONS_TOTAL: &str = "rule_evaluations_total";
/// 单次规则评估耗时
pub const RULE_EVALUATION_DURATION_SECONDS: &str = "rule_evaluation_duration_seconds";
/// 规则状态迁移次数（标签 to=matched|unmatched）
pub const RULE_TRANSITIONS_TOTAL: &str = "rule_transitions_total";
/// 动作处理器调用次数（标签 phase=apply|revert, outcome=ok|error|missing）
pub const RULE_ACTION_INVOCATIONS_TOTAL: &str = "rule_action_invocations_total";
/// 事实源创建次数（标签 outcome=ok|error）
pub const FACT_SOURCE_CREATIONS_TOTAL: &str = "fact_source_creations_total";

/// 注册指标描述
///
/// 这些描述会出现在导出端点的 HELP 注释中。
pub fn describe_metrics() {
    metrics::describe_counter!(RULE_EVALUATIONS_TOTAL, "Total number of rule evaluations");
    metrics::describe_histogram!(
        RULE_EVALUATION_DURATION_SECONDS,
        "Rule evaluation duration in seconds"
    );
    metrics::describe_counter!(
        RULE_TRANSITIONS_TOTAL,
        "Total number of rule activation state transitions"
    );
    metrics::describe_counter!(
        RULE_ACTION_INVOCATIONS_TOTAL,
        "Total number of action handler apply/revert invocations"
    );
    metrics::describe_counter!(
        FACT_SOURCE_CREATIONS_TOTAL,
        "Total number of fact source creations"
    );
}
