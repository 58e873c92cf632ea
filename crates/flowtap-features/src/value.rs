//! Type-erased numeric value carried through the feature graph, and the
//! promotion rules used whenever two values of different families meet.

use std::net::IpAddr;

/// Unit a [`Value::Time`] count is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    /// Multiplier to rescale a count in this unit up to nanoseconds.
    fn nanos_per_unit(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1e9,
            TimeUnit::Milliseconds => 1e6,
            TimeUnit::Microseconds => 1e3,
            TimeUnit::Nanoseconds => 1.0,
        }
    }
}

/// A value flowing through the feature DAG.
///
/// `Int`/`UInt`/`Float` form the numeric families the promotion table in
/// [`upconvert`] operates over; `Time` is its own family, always carried as a
/// `u64` count regardless of unit (the nanosecond-typed branch does not get
/// the signed special case the distilled exporter this crate follows once
/// had).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Time(TimeUnit, u64),
    Bytes(Vec<u8>),
    Str(String),
    Ip(IpAddr),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    /// Best-effort conversion to `f64`, used by aggregators that only need
    /// an ordering or an arithmetic mean and don't care about the source
    /// family.
    pub fn to_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Time(_, v) => Some(*v as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// True for the families `upconvert` knows how to promote.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Time(_, _)
        )
    }
}

/// Promote `a` and `b` to a common numeric family, following the rule table:
/// same family is left untouched, `int`+`uint` becomes `int`, anything mixed
/// with `float` becomes `float`, anything mixed with `time` becomes `time`
/// (the non-time side is reinterpreted as a raw count in the time side's
/// unit), and `time`+`time` with differing units is rescaled to nanoseconds.
///
/// Non-numeric values are returned unchanged.
pub fn upconvert(a: Value, b: Value) -> (Value, Value) {
    use Value::*;
    match (a, b) {
        (Int(x), Int(y)) => (Int(x), Int(y)),
        (UInt(x), UInt(y)) => (UInt(x), UInt(y)),
        (Float(x), Float(y)) => (Float(x), Float(y)),

        (Int(x), UInt(y)) => (Int(x), Int(y as i64)),
        (UInt(x), Int(y)) => (Int(x as i64), Int(y)),

        (Float(x), UInt(y)) => (Float(x), Float(y as f64)),
        (UInt(x), Float(y)) => (Float(x as f64), Float(y)),
        (Float(x), Int(y)) => (Float(x), Float(y as f64)),
        (Int(x), Float(y)) => (Float(x as f64), Float(y)),

        (Time(u, x), Time(v, y)) if u == v => (Time(u, x), Time(v, y)),
        (Time(u, x), Time(v, y)) => (
            Time(TimeUnit::Nanoseconds, rescale_to_nanos(u, x)),
            Time(TimeUnit::Nanoseconds, rescale_to_nanos(v, y)),
        ),

        (Time(u, x), other) if other.is_numeric() => (Time(u, x), Time(u, numeric_as_u64(&other))),
        (other, Time(u, y)) if other.is_numeric() => (Time(u, numeric_as_u64(&other)), Time(u, y)),

        (x, y) => (x, y),
    }
}

fn rescale_to_nanos(unit: TimeUnit, count: u64) -> u64 {
    (count as f64 * unit.nanos_per_unit()).round() as u64
}

fn numeric_as_u64(v: &Value) -> u64 {
    match v {
        Value::Int(x) => *x as u64,
        Value::UInt(x) => *x,
        Value::Float(x) => *x as u64,
        Value::Time(_, x) => *x,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_family_passes_through() {
        assert_eq!(
            upconvert(Value::Int(1), Value::Int(2)),
            (Value::Int(1), Value::Int(2))
        );
    }

    #[test]
    fn int_and_uint_promote_to_int() {
        let (a, b) = upconvert(Value::Int(-1), Value::UInt(5));
        assert_eq!(a, Value::Int(-1));
        assert_eq!(b, Value::Int(5));
    }

    #[test]
    fn float_dominates_mixed_numeric() {
        let (a, b) = upconvert(Value::Float(1.5), Value::UInt(2));
        assert_eq!(a, Value::Float(1.5));
        assert_eq!(b, Value::Float(2.0));
    }

    #[test]
    fn time_mismatched_units_rescale_to_nanos() {
        let (a, b) = upconvert(
            Value::Time(TimeUnit::Seconds, 2),
            Value::Time(TimeUnit::Milliseconds, 500),
        );
        assert_eq!(a, Value::Time(TimeUnit::Nanoseconds, 2_000_000_000));
        assert_eq!(b, Value::Time(TimeUnit::Nanoseconds, 500_000_000));
    }
}
