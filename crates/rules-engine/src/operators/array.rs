//! 数组操作符
//!
//! 左操作数均为数组（`stringContains` 系列除外）。`all*` 在空数组上为真，`one*` 在空数组上为假。

use super::helpers::{
    as_f64, contains_strict, is_number_like, is_range_number, is_simple, loose_eq, parse_regex,
    range_bounds,
};
use super::{Arity, Operator};
use serde_json::Value;

fn array_operator(name: &str, predicate: fn(&[Value], &Value) -> bool) -> Operator {
    Operator::binary(name, move |value, operand| {
        value
            .as_array()
            .is_some_and(|items| predicate(items, operand))
    })
    .with_lhs_validator(Value::is_array)
}

/// 基于正则的数组操作符，非法正则返回 `InvalidOperand`
fn pattern_operator(name: &str, any: bool) -> Operator {
    Operator::new(name, Arity::Binary, move |value, pattern, _| {
        let (Some(items), Some(pattern)) = (value.as_array(), pattern.and_then(Value::as_str))
        else {
            return Ok(false);
        };
        let regex = parse_regex(pattern)?;
        let matches = |item: &Value| item.as_str().is_some_and(|s| regex.is_match(s));
        Ok(if any {
            items.iter().any(matches)
        } else {
            items.iter().all(matches)
        })
    })
    .with_lhs_validator(Value::is_array)
    .with_rhs_validator(Value::is_string)
}

fn in_range(item: &Value, range: &Value) -> bool {
    match (as_f64(item), range_bounds(range)) {
        (Some(n), Some((from, to))) => n >= from && n <= to,
        _ => false,
    }
}

fn number_cmp(item: &Value, operand: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (as_f64(item), as_f64(operand)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn length_operator(name: &str, cmp: fn(usize, f64) -> bool) -> Operator {
    Operator::binary(name, move |value, operand| {
        match (value.as_array(), as_f64(operand)) {
            (Some(items), Some(length)) => cmp(items.len(), length),
            _ => false,
        }
    })
    .with_lhs_validator(Value::is_array)
    .with_rhs_validator(is_number_like)
}

fn list_operand(operand: &Value) -> &[Value] {
    operand.as_array().map(Vec::as_slice).unwrap_or_default()
}

pub fn array_operators() -> Vec<Operator> {
    vec![
        array_operator("arrayContains", |items, operand| {
            contains_strict(items, operand)
        })
        .with_rhs_validator(is_simple),
        array_operator("notArrayContains", |items, operand| {
            !contains_strict(items, operand)
        })
        .with_rhs_validator(is_simple),
        Operator::binary("stringContains", |value, operand| {
            match (value.as_str(), operand.as_str()) {
                (Some(text), Some(sub)) => text.contains(sub),
                _ => false,
            }
        })
        .with_lhs_validator(Value::is_string)
        .with_rhs_validator(Value::is_string),
        Operator::binary("notStringContains", |value, operand| {
            match (value.as_str(), operand.as_str()) {
                (Some(text), Some(sub)) => !text.contains(sub),
                _ => false,
            }
        })
        .with_lhs_validator(Value::is_string)
        .with_rhs_validator(Value::is_string),
        array_operator("allEqual", |items, operand| {
            items.iter().all(|item| loose_eq(item, operand))
        })
        .with_rhs_validator(is_simple),
        array_operator("allGreater", |items, operand| {
            items.iter().all(|item| number_cmp(item, operand, |a, b| a > b))
        })
        .with_rhs_validator(is_number_like),
        array_operator("allLower", |items, operand| {
            items.iter().all(|item| number_cmp(item, operand, |a, b| a < b))
        })
        .with_rhs_validator(is_number_like),
        array_operator("allIn", |items, operand| {
            let list = list_operand(operand);
            items.iter().all(|item| contains_strict(list, item))
        })
        .with_rhs_validator(Value::is_array),
        array_operator("allNotIn", |items, operand| {
            let list = list_operand(operand);
            !items.iter().any(|item| contains_strict(list, item))
        })
        .with_rhs_validator(Value::is_array),
        pattern_operator("allMatch", false),
        array_operator("allRangeNumber", |items, operand| {
            items.iter().all(|item| in_range(item, operand))
        })
        .with_rhs_validator(is_range_number),
        array_operator("oneEquals", |items, operand| {
            items.iter().any(|item| loose_eq(item, operand))
        })
        .with_rhs_validator(is_simple),
        array_operator("oneGreater", |items, operand| {
            items.iter().any(|item| number_cmp(item, operand, |a, b| a > b))
        })
        .with_rhs_validator(is_number_like),
        array_operator("oneLower", |items, operand| {
            items.iter().any(|item| number_cmp(item, operand, |a, b| a < b))
        })
        .with_rhs_validator(is_number_like),
        array_operator("oneIn", |items, operand| {
            let list = list_operand(operand);
            items.iter().any(|item| contains_strict(list, item))
        })
        .with_rhs_validator(Value::is_array),
        pattern_operator("oneMatches", true),
        array_operator("oneRangeNumber", |items, operand| {
            items.iter().any(|item| in_range(item, operand))
        })
        .with_rhs_validator(is_range_number),
        length_operator("lengthEquals", |len, n| len as f64 == n),
        length_operator("lengthNotEquals", |len, n| len as f64 != n),
        length_operator("lengthGreaterThan", |len, n| len as f64 > n),
        length_operator("lengthGreaterThanOrEquals", |len, n| len as f64 >= n),
        length_operator("lengthLessThan", |len, n| (len as f64) < n),
        length_operator("lengthLessThanOrEquals", |len, n| len as f64 <= n),
    ]
}
