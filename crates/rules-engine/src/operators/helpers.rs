//! 操作符公共辅助函数：宽松比较、类型判断、正则缓存与日期解析

use crate::error::{Result, RuleError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::sync::LazyLock;

static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// 获取值的类型名称
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 尝试将 Value 转换为 f64（数字或数字字符串）
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 数字或可解析为数字的字符串
pub(crate) fn is_number_like(value: &Value) -> bool {
    as_f64(value).is_some_and(f64::is_finite)
}

/// 字符串、数字或布尔值
pub(crate) fn is_simple(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// `[min, max]` 形式的数值区间
pub(crate) fn is_range_number(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|arr| arr.len() == 2 && arr.iter().all(is_number_like))
}

/// 读取 `[min, max]` 区间，调用前需已通过 `is_range_number` 校验
pub(crate) fn range_bounds(value: &Value) -> Option<(f64, f64)> {
    let arr = value.as_array()?;
    Some((as_f64(arr.first()?)?, as_f64(arr.get(1)?)?))
}

/// 宽松相等
///
/// 同类型直接比较；数字与字符串、布尔与数字之间按数值比较；null 只与 null 相等。
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Array(_), _) | (_, Value::Array(_)) => a == b,
        (Value::Object(_), _) | (_, Value::Object(_)) => a == b,
        _ => match (loose_number(a), loose_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn loose_number(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        _ => as_f64(value),
    }
}

/// 数组中是否存在宽松相等的元素
pub(crate) fn contains_loose(array: &[Value], needle: &Value) -> bool {
    array.iter().any(|item| loose_eq(item, needle))
}

/// 严格相等：类型必须一致，数字按数值比较（1 与 1.0 相等）
pub(crate) fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// 数组中是否存在严格相等的元素
pub(crate) fn contains_strict(array: &[Value], needle: &Value) -> bool {
    array.iter().any(|item| strict_eq(item, needle))
}

/// 编译正则，支持 `/pattern/flags` 写法（flags 支持 i、m、s）
pub(crate) fn parse_regex(input: &str) -> Result<Regex> {
    if let Some(cached) = REGEX_CACHE.get(input) {
        return Ok(cached.clone());
    }

    let (pattern, flags) = match input.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
        Some((pattern, flags)) if flags.chars().all(|c| c.is_ascii_alphabetic()) => {
            (pattern, flags)
        }
        _ => (input, ""),
    };

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| RuleError::InvalidOperand(format!("无效的正则表达式 '{}': {}", input, e)))?;

    REGEX_CACHE.insert(input.to_string(), regex.clone());
    Ok(regex)
}

/// 解析日期时间：RFC 3339、`YYYY-MM-DD`、`YYYY-MM-DDTHH:MM[:SS]`（按 UTC）或毫秒时间戳
pub(crate) fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64));
            millis
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| RuleError::InvalidOperand(format!("无效的时间戳: {}", n)))
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(dt.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .ok_or_else(|| RuleError::InvalidOperand(format!("无法解析日期时间: '{}'", s)))
        }
        other => Err(RuleError::TypeMismatch {
            expected: "datetime string or epoch milliseconds".to_string(),
            actual: type_name(other).to_string(),
        }),
    }
}

/// 可解析为日期的值
pub(crate) fn is_date_like(value: &Value) -> bool {
    parse_datetime(value).is_ok()
}
