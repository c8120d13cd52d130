// see [Definitions of the SI units: The binary prefixes](https://physics.nist.gov/cuu/Units/binary.html)
// see [Managing Compute Resources for Containers - Kubernetes](https://kubernetes.io/docs/concepts/configuration/manage-compute-resources-container/)
// see [apimachinery/quantity.go at master · kubernetes/apimachinery](https://github.com/kubernetes/apimachinery/blob/master/pkg/api/resource/quantity.go)

use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to parse scale of '{0}'")]
    ScaleParseError(String),

    #[error("Failed to read Qty (num) from '{0}'")]
    NumParseError(String),

    #[error("Qty '{0}' is more precise than a nano unit")]
    TooPrecise(String),

    #[error("Qty '{0}' is out of range")]
    OutOfRange(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct SiUnit {
    label: &'static str,
    pow10: i64,
    pow2: u32,
}

static ALL: [SiUnit; 16] = [
    SiUnit { label: "", pow10: 0, pow2: 0 },
    SiUnit { label: "n", pow10: -9, pow2: 0 },
    SiUnit { label: "u", pow10: -6, pow2: 0 },
    SiUnit { label: "m", pow10: -3, pow2: 0 },
    SiUnit { label: "k", pow10: 3, pow2: 0 },
    SiUnit { label: "M", pow10: 6, pow2: 0 },
    SiUnit { label: "G", pow10: 9, pow2: 0 },
    SiUnit { label: "T", pow10: 12, pow2: 0 },
    SiUnit { label: "P", pow10: 15, pow2: 0 },
    SiUnit { label: "E", pow10: 18, pow2: 0 },
    SiUnit { label: "Ki", pow10: 0, pow2: 10 },
    SiUnit { label: "Mi", pow10: 0, pow2: 20 },
    SiUnit { label: "Gi", pow10: 0, pow2: 30 },
    SiUnit { label: "Ti", pow10: 0, pow2: 40 },
    SiUnit { label: "Pi", pow10: 0, pow2: 50 },
    SiUnit { label: "Ei", pow10: 0, pow2: 60 },
];

impl FromStr for SiUnit {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(unit) = ALL.iter().find(|v| v.label == s) {
            return Ok(unit.clone());
        }
        // "1e3" and "1E3" are decimal exponents
        s.strip_prefix(['e', 'E'])
            .and_then(|exponent| i64::from_str(exponent).ok())
            .map(|pow10| SiUnit { label: "e", pow10, pow2: 0 })
            .ok_or_else(|| Error::ScaleParseError(s.to_owned()))
    }
}

const NANO_POW10: i64 = 9;

/// An exact resource quantity, kept as a count of nano units so that sums of
/// `m`, `Ki`, decimal and exponent forms never lose precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qty {
    nanos: i128,
}

impl Qty {
    pub fn zero() -> Self {
        Self::default()
    }

    /// The value as an integer count of `10^-pow10` units (3 for milli, 0 for
    /// plain units). `None` when a fraction would be dropped or the result
    /// does not fit in an i64.
    pub fn to_scaled_i64(&self, pow10: u32) -> Option<i64> {
        let shift = u32::try_from(NANO_POW10).ok()?.checked_sub(pow10)?;
        let divisor = 10_i128.pow(shift);
        if self.nanos % divisor != 0 {
            return None;
        }
        i64::try_from(self.nanos / divisor).ok()
    }
}

impl FromStr for Qty {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (negative, unsigned) = match input.as_bytes().first() {
            Some(b'-') => (true, &input[1..]),
            Some(b'+') => (false, &input[1..]),
            _ => (false, input),
        };
        let num_end = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (num_str, unit_str) = unsigned.split_at(num_end);
        let (int_part, frac_part) = num_str.split_once('.').unwrap_or((num_str, ""));
        if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
            return Err(Error::NumParseError(s.to_owned()));
        }
        let mantissa = i128::from_str(&format!("{int_part}{frac_part}"))
            .map_err(|_| Error::OutOfRange(s.to_owned()))?;
        let unit = SiUnit::from_str(unit_str).map_err(|_| Error::ScaleParseError(s.to_owned()))?;

        let frac_len = i64::try_from(frac_part.len()).map_err(|_| Error::OutOfRange(s.to_owned()))?;
        let exp10 = unit
            .pow10
            .checked_sub(frac_len)
            .and_then(|e| e.checked_add(NANO_POW10))
            .ok_or_else(|| Error::OutOfRange(s.to_owned()))?;

        let mut nanos = 2_i128
            .checked_pow(unit.pow2)
            .and_then(|factor| mantissa.checked_mul(factor))
            .ok_or_else(|| Error::OutOfRange(s.to_owned()))?;
        if nanos != 0 {
            if exp10 >= 0 {
                nanos = u32::try_from(exp10)
                    .ok()
                    .and_then(|e| 10_i128.checked_pow(e))
                    .and_then(|factor| nanos.checked_mul(factor))
                    .ok_or_else(|| Error::OutOfRange(s.to_owned()))?;
            } else {
                let divisor = u32::try_from(exp10.unsigned_abs())
                    .ok()
                    .and_then(|e| 10_i128.checked_pow(e))
                    .filter(|divisor| nanos % divisor == 0)
                    .ok_or_else(|| Error::TooPrecise(s.to_owned()))?;
                nanos /= divisor;
            }
        }
        Ok(Qty {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

impl std::fmt::Display for Qty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (divisor, label) = [(1_000_000_000, ""), (1_000_000, "m"), (1_000, "u")]
            .into_iter()
            .find(|(divisor, _)| self.nanos % divisor == 0)
            .unwrap_or((1, "n"));
        write!(f, "{}{}", self.nanos / divisor, label)
    }
}

impl std::ops::Add for &Qty {
    type Output = Qty;
    // saturate: an overflowing sum then fails the i64 conversion instead of wrapping
    fn add(self, other: Self) -> Qty {
        Qty {
            nanos: self.nanos.saturating_add(other.nanos),
        }
    }
}

impl<'b> std::ops::AddAssign<&'b Qty> for Qty {
    fn add_assign(&mut self, other: &'b Self) {
        *self = &*self + other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_to_milli() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Qty::from_str("100m")?.to_scaled_i64(3), Some(100));
        assert_eq!(Qty::from_str("1")?.to_scaled_i64(3), Some(1000));
        assert_eq!(Qty::from_str("0.5")?.to_scaled_i64(3), Some(500));
        assert_eq!(Qty::from_str("2.25")?.to_scaled_i64(3), Some(2250));
        assert_eq!(Qty::from_str("1500u")?.to_scaled_i64(3), None);
        Ok(())
    }

    #[test]
    fn test_parse_to_bytes() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Qty::from_str("128974848")?.to_scaled_i64(0), Some(128_974_848));
        assert_eq!(Qty::from_str("129e6")?.to_scaled_i64(0), Some(129_000_000));
        assert_eq!(Qty::from_str("129M")?.to_scaled_i64(0), Some(129_000_000));
        assert_eq!(Qty::from_str("123Mi")?.to_scaled_i64(0), Some(128_974_848));
        assert_eq!(Qty::from_str("1.5Gi")?.to_scaled_i64(0), Some(1_610_612_736));
        assert_eq!(Qty::from_str("1E")?.to_scaled_i64(0), Some(1_000_000_000_000_000_000));
        assert_eq!(Qty::from_str("0.5")?.to_scaled_i64(0), None);
        Ok(())
    }

    #[test]
    fn test_parse_exbi_and_exponents() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Qty::from_str("1Ei")?.to_scaled_i64(0), Some(1_i64 << 60));
        assert_eq!(Qty::from_str("1Pi")?.to_scaled_i64(0), Some(1_i64 << 50));
        assert_eq!(Qty::from_str("2E")?.to_scaled_i64(0), Some(2_000_000_000_000_000_000));
        assert_eq!(Qty::from_str("5e-3")?.to_scaled_i64(3), Some(5));
        assert_eq!(Qty::from_str("1E2")?.to_scaled_i64(0), Some(100));
        assert_eq!(
            Qty::from_str("1Ex"),
            Err(Error::ScaleParseError("1Ex".to_string()))
        );
        Ok(())
    }

    #[test]
    fn test_to_scaled_out_of_i64() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Qty::from_str("16Ei")?.to_scaled_i64(0), None);
        assert_eq!(Qty::from_str("9E")?.to_scaled_i64(3), None);
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Qty::from_str("abc"),
            Err(Error::NumParseError("abc".to_string()))
        );
        assert_eq!(
            Qty::from_str("1x"),
            Err(Error::ScaleParseError("1x".to_string()))
        );
        assert_eq!(
            Qty::from_str("1.2.3"),
            Err(Error::NumParseError("1.2.3".to_string()))
        );
        assert_eq!(
            Qty::from_str("0.5n"),
            Err(Error::TooPrecise("0.5n".to_string()))
        );
    }

    #[test]
    fn test_add() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(&Qty::from_str("1Ki")? + &Qty::from_str("1k")?, Qty::from_str("2024")?);
        let mut sum = Qty::zero();
        sum += &Qty::from_str("100m")?;
        sum += &Qty::from_str("250m")?;
        assert_eq!(sum.to_scaled_i64(3), Some(350));
        Ok(())
    }

    #[test]
    fn test_display() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Qty::from_str("2")?.to_string(), "2");
        assert_eq!(Qty::from_str("250m")?.to_string(), "250m");
        assert_eq!(Qty::from_str("-1.5")?.to_string(), "-1500m");
        assert_eq!(Qty::from_str("3n")?.to_string(), "3n");
        assert_eq!(Qty::from_str("0")?, Qty::zero());
        Ok(())
    }
}
