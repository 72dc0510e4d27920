//! Kubernetes resource quantities by value rather than by spelling.
//!
//! The API server stores quantities in canonical form (`0.5` becomes `500m`,
//! `0.5Gi` becomes `512Mi`), so user input and stored objects are compared
//! through [`amount`] and desired objects are built from [`canonical`] values.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const NANO: i128 = 1_000_000_000;

const BINARY_SUFFIXES: [(u32, &str); 6] = [
    (6, "Ei"),
    (5, "Pi"),
    (4, "Ti"),
    (3, "Gi"),
    (2, "Mi"),
    (1, "Ki"),
];

const DECIMAL_SUFFIXES: [(i32, &str); 10] = [
    (18, "E"),
    (15, "P"),
    (12, "T"),
    (9, "G"),
    (6, "M"),
    (3, "k"),
    (0, ""),
    (-3, "m"),
    (-6, "u"),
    (-9, "n"),
];

/// Suffix family a quantity was written in; canonical output keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    BinarySI,
    DecimalSI,
    DecimalExponent,
}

/// A parsed quantity: its value in units of 10^-9 plus its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedQuantity {
    nanos: i128,
    format: Format,
}

/// What two quantities are compared by. Unparsable input compares by text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Amount {
    Nanos(i128),
    Raw(String),
}

impl ParsedQuantity {
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    pub fn format(&self) -> Format {
        self.format
    }
}

fn pow(base: i128, exp: u32) -> Option<i128> {
    base.checked_pow(exp)
}

pub fn parse(raw: &str) -> Option<ParsedQuantity> {
    let s = raw.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (int, frac) = number.split_once('.').unwrap_or((number, ""));
    if (int.is_empty() && frac.is_empty()) || frac.contains('.') || frac.len() > 18 {
        return None;
    }

    let digits = format!("{int}{frac}");
    let mantissa: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    let mut denominator = pow(10, frac.len() as u32)?;

    let (numerator, format) = match suffix {
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {
            let (k, _) = BINARY_SUFFIXES.iter().find(|(_, s)| *s == suffix)?;
            (
                mantissa.checked_mul(pow(1024, *k)?)?.checked_mul(NANO)?,
                Format::BinarySI,
            )
        }
        _ => {
            let (exp, format) = match DECIMAL_SUFFIXES.iter().find(|(_, s)| *s == suffix) {
                Some((e, _)) => (*e, Format::DecimalSI),
                None => {
                    let e: i32 = suffix.strip_prefix(['e', 'E'])?.parse().ok()?;
                    if !(-30..=30).contains(&e) {
                        return None;
                    }
                    (e, Format::DecimalExponent)
                }
            };
            let shift = exp + 9;
            let numerator = if shift >= 0 {
                mantissa.checked_mul(pow(10, shift as u32)?)?
            } else {
                denominator = denominator.checked_mul(pow(10, shift.unsigned_abs())?)?;
                mantissa
            };
            (numerator, format)
        }
    };

    // sub-nano precision rounds up, as the API server does
    let mut nanos = numerator / denominator;
    if numerator % denominator != 0 {
        nanos += 1;
    }
    Some(ParsedQuantity {
        nanos: if negative { -nanos } else { nanos },
        format,
    })
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.nanos;
        if v == 0 {
            return f.write_str("0");
        }
        if self.format == Format::BinarySI && v % NANO == 0 && (v / NANO).abs() >= 1024 {
            let whole = v / NANO;
            for (k, suffix) in BINARY_SUFFIXES {
                let unit = 1024_i128.pow(k);
                if whole % unit == 0 {
                    return write!(f, "{}{suffix}", whole / unit);
                }
            }
            return write!(f, "{whole}");
        }
        for (exp, suffix) in DECIMAL_SUFFIXES {
            let unit = 10_i128.pow((exp + 9) as u32);
            if v % unit != 0 {
                continue;
            }
            return match self.format {
                Format::DecimalExponent if exp != 0 => write!(f, "{}e{exp}", v / unit),
                Format::DecimalExponent => write!(f, "{}", v / unit),
                _ => write!(f, "{}{suffix}", v / unit),
            };
        }
        write!(f, "{v}n")
    }
}

/// The form the API server would store `q` in; unparsable input is kept.
pub fn canonical(q: &Quantity) -> Quantity {
    parse(&q.0).map_or_else(|| q.clone(), |p| Quantity(p.to_string()))
}

pub fn amount(q: &Quantity) -> Amount {
    parse(&q.0).map_or_else(|| Amount::Raw(q.0.clone()), |p| Amount::Nanos(p.nanos))
}

fn canonical_map(map: Option<BTreeMap<String, Quantity>>) -> Option<BTreeMap<String, Quantity>> {
    map.map(|m| m.into_iter().map(|(k, q)| (k, canonical(&q))).collect())
}

pub fn canonical_requirements(r: ResourceRequirements) -> ResourceRequirements {
    ResourceRequirements {
        requests: canonical_map(r.requests),
        limits: canonical_map(r.limits),
        ..r
    }
}

fn amounts(map: &Option<BTreeMap<String, Quantity>>) -> BTreeMap<&str, Amount> {
    map.iter()
        .flatten()
        .map(|(k, q)| (k.as_str(), amount(q)))
        .collect()
}

/// Requirements equal up to quantity spelling.
pub fn same_requirements(a: &Option<ResourceRequirements>, b: &Option<ResourceRequirements>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            amounts(&a.requests) == amounts(&b.requests)
                && amounts(&a.limits) == amounts(&b.limits)
                && a.claims == b.claims
        }
        _ => false,
    }
}
