//! 数值比较操作符

use super::Operator;
use super::helpers::{as_f64, is_number_like};

fn compare(name: &str, cmp: fn(f64, f64) -> bool) -> Operator {
    Operator::binary(name, move |a, b| match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    })
    .with_lhs_validator(is_number_like)
    .with_rhs_validator(is_number_like)
}

pub fn number_operators() -> Vec<Operator> {
    vec![
        compare("greaterThan", |a, b| a > b),
        compare("greaterThanOrEqual", |a, b| a >= b),
        compare("lessThan", |a, b| a < b),
        compare("lessOrEqual", |a, b| a <= b),
    ]
}
