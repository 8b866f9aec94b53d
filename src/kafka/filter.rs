/// Decides whether a discovered stream belongs to this host. Called once per
/// discovered topic on every subscription refresh, so implementations must
/// be cheap and side-effect-free.
pub trait StreamFilter: Send + Sync {
    fn matches(&self, stream: &str) -> bool;
}

/// Default filter: own every stream whose name ends in the configured suffix.
pub struct SuffixStreamFilter {
    suffix: String,
}

impl SuffixStreamFilter {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl StreamFilter for SuffixStreamFilter {
    fn matches(&self, stream: &str) -> bool {
        stream.ends_with(&self.suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_filter() {
        let filter = SuffixStreamFilter::new("-events");
        assert!(filter.matches("traces-events"));
        assert!(filter.matches("-events"));
        assert!(!filter.matches("traces-metrics"));
        assert!(!filter.matches("events"));
        assert!(!filter.matches(""));
    }
}
