//! 基础操作符

use super::Operator;
use super::helpers::{contains_strict, loose_eq, parse_regex};
use serde_json::Value;

/// 基础操作符：相等、包含、定义检查、模式匹配与布尔判断
pub fn basic_operators() -> Vec<Operator> {
    vec![
        Operator::binary("equals", loose_eq),
        Operator::binary("notEquals", |a, b| !loose_eq(a, b)),
        Operator::binary("inArray", |value, list| {
            list.as_array()
                .is_some_and(|list| contains_strict(list, value))
        })
        .with_rhs_validator(Value::is_array),
        Operator::binary("notInArray", |value, list| {
            list.as_array()
                .is_some_and(|list| !contains_strict(list, value))
        })
        .with_rhs_validator(Value::is_array),
        Operator::binary("inString", |value, text| {
            match (value.as_str(), text.as_str()) {
                (Some(value), Some(text)) => text.contains(value),
                _ => false,
            }
        })
        .with_lhs_validator(Value::is_string)
        .with_rhs_validator(Value::is_string),
        Operator::binary("notInString", |value, text| {
            match (value.as_str(), text.as_str()) {
                (Some(value), Some(text)) => !text.contains(value),
                _ => false,
            }
        })
        .with_lhs_validator(Value::is_string)
        .with_rhs_validator(Value::is_string),
        Operator::unary("isDefined", |value| !value.is_null()),
        Operator::unary("isUndefined", Value::is_null),
        Operator::new("matchesPattern", super::Arity::Binary, |value, pattern, _| {
            let (Some(value), Some(pattern)) = (value.as_str(), pattern.and_then(Value::as_str))
            else {
                return Ok(false);
            };
            Ok(parse_regex(pattern)?.is_match(value))
        })
        .with_lhs_validator(Value::is_string)
        .with_rhs_validator(Value::is_string),
        Operator::unary("isTrue", |value| value.as_bool() == Some(true)),
        Operator::unary("isFalse", |value| value.as_bool() == Some(false)),
    ]
}
