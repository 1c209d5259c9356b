use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// A resource quantity with exact integer arithmetic in milli-units.
///
/// Parses decimal-suffixed (`m`, `k`, `M`, `G`, `T`), binary-suffixed
/// (`Ki`, `Mi`, `Gi`, `Ti`), and plain integer strings. `500m` is half a
/// unit; `5Gi` is 5 * 1024^3 units. Never floating point: fractional
/// values that do not land on a whole number of millis are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    pub fn from_units(units: i64) -> Self {
        Self {
            millis: units * 1000,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn zero() -> Self {
        Self { millis: 0 }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn is_negative(&self) -> bool {
        self.millis < 0
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Saturating addition.
    pub fn add(&self, other: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_add(other.millis),
        }
    }

    /// Saturating subtraction; result may be negative.
    pub fn sub(&self, other: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_sub(other.millis),
        }
    }

    /// Clamp negative values to zero.
    pub fn max_zero(&self) -> Quantity {
        Quantity {
            millis: self.millis.max(0),
        }
    }

    /// Parse a quantity string like `2`, `500m`, `5Gi`, `10G`, `1.5Gi`.
    pub fn parse(s: &str) -> anyhow::Result<Quantity> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("empty quantity");
        }

        // Split off the suffix: longest trailing run of alphabetic chars.
        let split = s
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_alphabetic())
            .last()
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            anyhow::bail!("quantity '{}' has no numeric part", s);
        }

        // Scale factor in millis per parsed unit.
        let scale_millis: i128 = match suffix {
            "" => 1000,
            "m" => 1,
            "k" => 1000 * 1_000,
            "M" => 1000 * 1_000_000,
            "G" => 1000 * 1_000_000_000,
            "T" => 1000 * 1_000_000_000_000,
            "Ki" => 1000 * 1024,
            "Mi" => 1000 * 1024 * 1024,
            "Gi" => 1000 * 1024 * 1024 * 1024,
            "Ti" => 1000 * 1024 * 1024 * 1024 * 1024,
            other => anyhow::bail!("quantity '{}' has unknown suffix '{}'", s, other),
        };

        let negative = number.starts_with('-');
        let unsigned = number.trim_start_matches(['-', '+']);
        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((i, f)) => (i, f),
            None => (unsigned, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            anyhow::bail!("quantity '{}' has no digits", s);
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            anyhow::bail!("quantity '{}' is not numeric", s);
        }

        let int_val: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse()?
        };
        let mut millis: i128 = int_val * scale_millis;

        if !frac_part.is_empty() {
            let frac_val: i128 = frac_part.parse()?;
            let denom: i128 = 10_i128.pow(frac_part.len() as u32);
            let frac_millis = frac_val * scale_millis;
            if frac_millis % denom != 0 {
                anyhow::bail!("quantity '{}' is not representable in milli-units", s);
            }
            millis += frac_millis / denom;
        }

        if negative {
            millis = -millis;
        }
        let millis = i64::try_from(millis)
            .map_err(|_| anyhow::anyhow!("quantity '{}' overflows", s))?;
        Ok(Quantity { millis })
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Quantity::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Mapping from resource name to quantity, ordered for stable serialization.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Sum two resource lists; names present in either appear in the result.
pub fn add(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut out = a.clone();
    for (name, q) in b {
        let entry = out.entry(name.clone()).or_insert_with(Quantity::zero);
        *entry = entry.add(*q);
    }
    out
}

/// Signed difference `a - b`; entries may be negative.
pub fn subtract(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut out = a.clone();
    for (name, q) in b {
        let entry = out.entry(name.clone()).or_insert_with(Quantity::zero);
        *entry = entry.sub(*q);
    }
    out
}

/// Restrict a resource list to the given names.
pub fn mask(list: &ResourceList, names: &[String]) -> ResourceList {
    list.iter()
        .filter(|(name, _)| names.contains(name))
        .map(|(name, q)| (name.clone(), *q))
        .collect()
}

/// Clamp every entry to be non-negative.
pub fn max_zero(list: &ResourceList) -> ResourceList {
    list.iter()
        .map(|(name, q)| (name.clone(), q.max_zero()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_milli() {
        assert_eq!(Quantity::parse("2").unwrap(), Quantity::from_units(2));
        assert_eq!(Quantity::parse("500m").unwrap(), Quantity::from_millis(500));
        assert_eq!(Quantity::parse("0").unwrap(), Quantity::zero());
        assert_eq!(
            Quantity::parse("-1").unwrap(),
            Quantity::from_units(-1)
        );
    }

    #[test]
    fn parse_suffixed() {
        assert_eq!(
            Quantity::parse("5Gi").unwrap(),
            Quantity::from_units(5 * 1024 * 1024 * 1024)
        );
        assert_eq!(
            Quantity::parse("10G").unwrap(),
            Quantity::from_units(10_000_000_000)
        );
        assert_eq!(
            Quantity::parse("128Mi").unwrap(),
            Quantity::from_units(128 * 1024 * 1024)
        );
        assert_eq!(Quantity::parse("1k").unwrap(), Quantity::from_units(1000));
    }

    #[test]
    fn parse_fractional_exact() {
        assert_eq!(
            Quantity::parse("1.5Gi").unwrap(),
            Quantity::from_units(3 * 1024 * 1024 * 1024 / 2)
        );
        assert_eq!(
            Quantity::parse("0.5").unwrap(),
            Quantity::from_millis(500)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Quantity::parse("").is_err());
        assert!(Quantity::parse("abc").is_err());
        assert!(Quantity::parse("5Xi").is_err());
        assert!(Quantity::parse("1.0001m").is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["2", "500m", "5368709120", "0"] {
            let q = Quantity::parse(s).unwrap();
            assert_eq!(Quantity::parse(&q.to_string()).unwrap(), q);
        }
    }

    #[test]
    fn list_arithmetic() {
        let mut a = ResourceList::new();
        a.insert("pods".to_string(), Quantity::from_units(3));
        a.insert("requests.cpu".to_string(), Quantity::from_millis(1500));
        let mut b = ResourceList::new();
        b.insert("pods".to_string(), Quantity::from_units(1));
        b.insert("requests.memory".to_string(), Quantity::from_units(512));

        let sum = add(&a, &b);
        assert_eq!(sum["pods"], Quantity::from_units(4));
        assert_eq!(sum["requests.cpu"], Quantity::from_millis(1500));
        assert_eq!(sum["requests.memory"], Quantity::from_units(512));

        let diff = subtract(&a, &b);
        assert_eq!(diff["pods"], Quantity::from_units(2));
        assert!(diff["requests.memory"].is_negative());
        assert_eq!(max_zero(&diff)["requests.memory"], Quantity::zero());
    }

    #[test]
    fn mask_keeps_only_named() {
        let mut a = ResourceList::new();
        a.insert("pods".to_string(), Quantity::from_units(3));
        a.insert("requests.cpu".to_string(), Quantity::from_millis(100));
        let masked = mask(&a, &["pods".to_string()]);
        assert_eq!(masked.len(), 1);
        assert!(masked.contains_key("pods"));
    }
}
