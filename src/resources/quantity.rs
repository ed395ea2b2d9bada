//! Kubernetes resource quantities
//!
//! Quantities are normalised to an integer count of nano-units so that
//! "0.2", "200m" and "200000000n" compare equal, as do "1Gi" and "1024Mi".

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use thiserror::Error;

const NANO_EXP: i32 = 9;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid quantity {input:?}: {reason}")]
pub struct QuantityError {
    pub input: String,
    pub reason: &'static str,
}

/// A parsed quantity in nano-units
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    nanos: i128,
}

impl Quantity {
    /// Value in nano-units
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    /// Whole units, rounded up (bytes for memory, cores for CPU)
    pub fn ceil_units(&self) -> i128 {
        let units = self.nanos / 1_000_000_000;
        if self.nanos % 1_000_000_000 > 0 {
            units + 1
        } else {
            units
        }
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse(input)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos % 1_000_000_000 == 0 {
            write!(f, "{}", self.nanos / 1_000_000_000)
        } else if self.nanos % 1_000_000 == 0 {
            write!(f, "{}m", self.nanos / 1_000_000)
        } else {
            write!(f, "{}n", self.nanos)
        }
    }
}

/// Parse a quantity string such as "250m", "1.5Gi" or "1e3".
pub fn parse(input: &str) -> Result<Quantity, QuantityError> {
    let err = |reason| QuantityError {
        input: input.to_string(),
        reason,
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(err("empty"));
    }

    let (negative, s) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(err("malformed number"));
    }

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.len() + frac_part.len() > 30 {
        return Err(err("too many digits"));
    }
    let mut mantissa: i128 = 0;
    for digit in int_part.bytes().chain(frac_part.bytes()) {
        mantissa = mantissa * 10 + i128::from(digit - b'0');
    }
    let frac_digits = frac_part.len() as i32;

    let (binary_shift, decimal_exp) = match suffix {
        "" => (0, 0),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        exp if exp.starts_with(['e', 'E']) => {
            let value: i32 = exp[1..].parse().map_err(|_| err("malformed exponent"))?;
            if !(-30..=30).contains(&value) {
                return Err(err("exponent out of range"));
            }
            (0, value)
        }
        _ => return Err(err("unknown suffix")),
    };

    let overflow = || err("out of range");
    let mut nanos = mantissa
        .checked_mul(1i128 << binary_shift)
        .ok_or_else(overflow)?;

    let scale = NANO_EXP + decimal_exp - frac_digits;
    match scale.cmp(&0) {
        Ordering::Greater => {
            nanos = 10i128
                .checked_pow(scale as u32)
                .and_then(|factor| nanos.checked_mul(factor))
                .ok_or_else(overflow)?;
        }
        Ordering::Less => {
            // Precision below one nano-unit rounds up, like the API server does
            let divisor = 10i128.checked_pow((-scale) as u32).ok_or_else(overflow)?;
            let rounded = nanos / divisor;
            nanos = if nanos % divisor > 0 { rounded + 1 } else { rounded };
        }
        Ordering::Equal => {}
    }

    Ok(Quantity {
        nanos: if negative { -nanos } else { nanos },
    })
}

/// Compare two quantity strings by value.
///
/// Unparseable strings only compare equal to themselves.
pub fn semantically_equal(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Compare two API quantities by value
pub fn k8s_equal(a: &K8sQuantity, b: &K8sQuantity) -> bool {
    semantically_equal(&a.0, &b.0)
}

/// Validate a quantity taken from a tenant spec and wrap it for the API
pub fn to_k8s(value: &str) -> Result<K8sQuantity, QuantityError> {
    parse(value)?;
    Ok(K8sQuantity(value.trim().to_string()))
}
