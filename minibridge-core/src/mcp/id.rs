//! JSON-RPC id correlation.
//!
//! Different decoders produce different numeric representations of the same
//! id (`42` vs `42.0`), so ids are compared by integral value when both sides
//! are numbers. A string id never matches a numeric one.

use serde_json::{Number, Value};

/// Returns true when `a` and `b` designate the same JSON-RPC id.
///
/// - two strings match when they are equal
/// - two numbers match when both hold the same exact integer value; a
///   non-integral float matches nothing
/// - anything else falls back to strict type and value equality
pub fn related_ids(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(sa), Value::String(sb)) => sa == sb,
        (Value::String(_), _) | (_, Value::String(_)) => false,
        (Value::Number(na), Value::Number(nb)) => {
            match (integral_value(na), integral_value(nb)) {
                (Some(ia), Some(ib)) => ia == ib,
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// Renders an id as a canonical string suitable for log fields and cache keys.
pub fn normalize_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format!("{:.0}", n.as_f64().unwrap_or_default())
            }
        }
        other => other.to_string(),
    }
}

/// Exact integer value of `n`. `i128` holds the whole `i64` and `u64` range.
fn integral_value(n: &Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i.into());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.into());
    }
    let f = n.as_f64()?;
    // 2^64 bounds every integer a JSON decoder produces.
    if f.fract() != 0.0 || !f.is_finite() || f.abs() > 18_446_744_073_709_551_616.0 {
        return None;
    }
    Some(f as i128)
}
