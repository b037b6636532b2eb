//! 日期操作符
//!
//! 日期值接受 RFC 3339 字符串、`YYYY-MM-DD` 字符串或毫秒时间戳。
//! `dateInNextMinutes` 与 `dateNotInNextMinutes` 隐式依赖当前时间事实 [`CURRENT_TIME_FACT`]。

use super::helpers::{as_f64, is_date_like, parse_datetime};
use super::{Arity, Operator, OperatorContext};
use crate::error::{Result, RuleError};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// 当前时间事实名，值为毫秒时间戳
pub const CURRENT_TIME_FACT: &str = "currentTime";

fn date_compare(name: &str, cmp: fn(DateTime<Utc>, DateTime<Utc>) -> bool) -> Operator {
    Operator::new(name, Arity::Binary, move |value, operand, _| {
        let operand = operand.ok_or_else(|| RuleError::InvalidOperand("缺少日期操作数".into()))?;
        Ok(cmp(parse_datetime(value)?, parse_datetime(operand)?))
    })
    .with_lhs_validator(is_date_like)
    .with_rhs_validator(is_date_like)
}

fn is_date_range(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|arr| arr.len() == 2 && arr.iter().all(is_date_like))
}

fn is_non_negative_number(value: &Value) -> bool {
    as_f64(value).is_some_and(|n| n.is_finite() && n >= 0.0)
}

fn current_time(context: &OperatorContext) -> Result<DateTime<Utc>> {
    let value = context
        .fact(CURRENT_TIME_FACT)
        .filter(|v| !v.is_null())
        .ok_or_else(|| RuleError::FactNotFound(CURRENT_TIME_FACT.to_string()))?;
    parse_datetime(value)
}

/// 计算 `[now, now + minutes]` 窗口
fn window(
    value: &Value,
    operand: Option<&Value>,
    context: &OperatorContext,
) -> Result<(DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)> {
    let date = parse_datetime(value)?;
    let minutes = operand
        .and_then(as_f64)
        .ok_or_else(|| RuleError::InvalidOperand("分钟数必须为数字".into()))?;
    let now = current_time(context)?;
    let end = Duration::try_milliseconds((minutes * 60_000.0) as i64)
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| RuleError::InvalidOperand(format!("分钟数超出可表示的时间范围: {}", minutes)))?;
    Ok((date, now, end))
}

pub fn date_operators() -> Vec<Operator> {
    vec![
        date_compare("dateBefore", |a, b| a < b),
        date_compare("dateAfter", |a, b| a > b),
        date_compare("dateEquals", |a, b| a.date_naive() == b.date_naive()),
        date_compare("dateNotEquals", |a, b| a.date_naive() != b.date_naive()),
        Operator::new("inRangeDate", Arity::Binary, |value, operand, _| {
            let range = operand
                .and_then(Value::as_array)
                .ok_or_else(|| RuleError::InvalidOperand("日期区间必须为 [from, to]".into()))?;
            let date = parse_datetime(value)?;
            let (from, to) = match range.as_slice() {
                [from, to] => (parse_datetime(from)?, parse_datetime(to)?),
                _ => return Err(RuleError::InvalidOperand("日期区间必须为 [from, to]".into())),
            };
            Ok(from <= date && date <= to)
        })
        .with_lhs_validator(is_date_like)
        .with_rhs_validator(is_date_range),
        Operator::new("dateInNextMinutes", Arity::Binary, |value, operand, context| {
            let (date, now, end) = window(value, operand, context)?;
            Ok(now <= date && date <= end)
        })
        .with_lhs_validator(is_date_like)
        .with_rhs_validator(is_non_negative_number)
        .with_implicit_facts([CURRENT_TIME_FACT]),
        Operator::new("dateNotInNextMinutes", Arity::Binary, |value, operand, context| {
            let (date, _, end) = window(value, operand, context)?;
            Ok(date > end)
        })
        .with_lhs_validator(is_date_like)
        .with_rhs_validator(is_non_negative_number)
        .with_implicit_facts([CURRENT_TIME_FACT]),
    ]
}
