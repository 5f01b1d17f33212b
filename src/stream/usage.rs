use crate::protocol::canonical::{PartialUsage, Usage};

/// Merges sparse usage fragments reported across a stream.
///
/// Every incoming fragment overwrites only the fields it sets; the record is
/// frozen once by [`UsageAccumulator::finalize`] when the turn ends.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    current: PartialUsage,
}

impl UsageAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, partial: PartialUsage) {
        let PartialUsage {
            input_tokens,
            output_tokens,
            thinking_tokens,
            cached_tokens,
            service_tier,
            region,
        } = partial;
        if input_tokens.is_some() {
            self.current.input_tokens = input_tokens;
        }
        if output_tokens.is_some() {
            self.current.output_tokens = output_tokens;
        }
        if thinking_tokens.is_some() {
            self.current.thinking_tokens = thinking_tokens;
        }
        if cached_tokens.is_some() {
            self.current.cached_tokens = cached_tokens;
        }
        if service_tier.is_some() {
            self.current.service_tier = service_tier;
        }
        if region.is_some() {
            self.current.region = region;
        }
    }

    /// Whether any token count has been observed.
    #[must_use]
    pub fn has_tokens(&self) -> bool {
        self.current.input_tokens.is_some()
            || self.current.output_tokens.is_some()
            || self.current.cached_tokens.is_some()
    }

    /// Complete usage, or `None` when no input, output or cached count was
    /// ever reported.
    #[must_use]
    pub fn finalize(&self) -> Option<Usage> {
        if !self.has_tokens() {
            return None;
        }
        Some(Usage {
            input_tokens: self.current.input_tokens.unwrap_or(0),
            output_tokens: self.current.output_tokens.unwrap_or(0),
            thinking_tokens: self.current.thinking_tokens,
            cached_tokens: self.current.cached_tokens,
            service_tier: self.current.service_tier.clone(),
            region: self.current.region.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(n: u64) -> PartialUsage {
        PartialUsage {
            input_tokens: Some(n),
            ..Default::default()
        }
    }

    fn output(n: u64) -> PartialUsage {
        PartialUsage {
            output_tokens: Some(n),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_is_per_field() {
        let mut acc = UsageAccumulator::new();
        acc.merge(input(5));
        acc.merge(output(3));
        acc.merge(input(7));
        let usage = acc.finalize().expect("usage");
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.cached_tokens, None);
    }

    #[test]
    fn test_granularity_does_not_matter() {
        let mut coarse = UsageAccumulator::new();
        coarse.merge(PartialUsage {
            input_tokens: Some(7),
            output_tokens: Some(3),
            ..Default::default()
        });

        let mut fine = UsageAccumulator::new();
        fine.merge(input(5));
        fine.merge(output(3));
        fine.merge(input(7));

        assert_eq!(coarse.finalize(), fine.finalize());
    }

    #[test]
    fn test_finalize_without_tokens_is_none() {
        let mut acc = UsageAccumulator::new();
        acc.merge(PartialUsage {
            service_tier: Some("default".to_string()),
            thinking_tokens: Some(12),
            ..Default::default()
        });
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn test_cached_alone_is_enough() {
        let mut acc = UsageAccumulator::new();
        acc.merge(PartialUsage {
            cached_tokens: Some(100),
            region: Some("us".to_string()),
            ..Default::default()
        });
        let usage = acc.finalize().expect("usage");
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.cached_tokens, Some(100));
        assert_eq!(usage.region.as_deref(), Some("us"));
    }
}
