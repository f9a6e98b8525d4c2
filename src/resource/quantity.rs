//! Parsing for Kubernetes resource quantities like `250m`, `128974848`, `129e6` or `123Mi`.
//! We only need approximate values for storing usage snapshots, so everything is parsed into an `f64`
//! in the base unit (cores for cpu, bytes for memory and storage).

use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidQuantity(pub String);

impl Display for InvalidQuantity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid quantity: '{}'", self.0)
    }
}

impl std::error::Error for InvalidQuantity {}

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a quantity string into its value in base units
pub fn parse(quantity: &str) -> Result<f64, InvalidQuantity> {
    let trimmed = quantity.trim();
    let invalid = || InvalidQuantity(quantity.to_owned());
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (number, multiplier) = split_suffix(trimmed);
    let value = number.parse::<f64>().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value * multiplier)
}

fn split_suffix(quantity: &str) -> (&str, f64) {
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return (number, *multiplier);
        }
    }
    // exponent notation like `129e6` must not have its `e` mistaken for the exa suffix `E`,
    // and a bare number ends with a digit, so only check decimal suffixes on a trailing letter
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            if !number.is_empty() && !number.ends_with(|c: char| c == 'e' || c == 'E') {
                return (number, *multiplier);
            }
        }
    }
    (quantity, 1.0)
}
