//! Metric key syntax: `name` or `name[param1,param2,...]`.

/// A parsed metric key borrowing from the request text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricKey<'a> {
    name: &'a str,
    params: Vec<&'a str>,
}

impl<'a> MetricKey<'a> {
    /// Parses a key, returning `None` for malformed input.
    pub fn parse(key: &'a str) -> Option<Self> {
        let key = key.trim();
        let (name, params) = match key.split_once('[') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(']')?;
                if inner.contains('[') || inner.contains(']') {
                    return None;
                }
                (name, inner.split(',').map(str::trim).collect())
            }
            None => (key, Vec::new()),
        };

        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid_name {
            return None;
        }

        Some(Self { name, params })
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Returns a parameter, treating empty ones as absent.
    pub fn param(&self, index: usize) -> Option<&'a str> {
        self.params.get(index).copied().filter(|p| !p.is_empty())
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_key() {
        let key = MetricKey::parse("system.uptime").unwrap();
        assert_eq!(key.name(), "system.uptime");
        assert_eq!(key.param_count(), 0);
        assert_eq!(key.param(0), None);
    }

    #[test]
    fn test_key_with_params() {
        let key = MetricKey::parse("system.cpu.load[, avg5]").unwrap();
        assert_eq!(key.name(), "system.cpu.load");
        assert_eq!(key.param_count(), 2);
        assert_eq!(key.param(0), None);
        assert_eq!(key.param(1), Some("avg5"));
    }

    #[test]
    fn test_malformed_keys() {
        for bad in ["", "[x]", "vm.memory.size[total", "a[b]c]", "a b", "a[[b]]"] {
            assert!(MetricKey::parse(bad).is_none(), "{bad:?} should not parse");
        }
    }
}
