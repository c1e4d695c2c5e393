use serde::{Deserialize, Serialize};

/// Token usage as reported by the upstream for one response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Build a usage record, deriving the total when the vendor omits it.
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: Option<u32>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens.unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
        }
    }

    /// Fold a later (possibly partial) report into this one. Vendors that
    /// split usage across events report each counter once.
    pub fn merge(&mut self, later: &Usage) {
        if later.prompt_tokens > 0 {
            self.prompt_tokens = later.prompt_tokens;
        }
        if later.completion_tokens > 0 {
            self.completion_tokens = later.completion_tokens;
        }
        self.total_tokens = later
            .total_tokens
            .max(self.prompt_tokens.saturating_add(self.completion_tokens));
    }
}

/// Narrow a wire token count, saturating instead of truncating.
pub fn clamp_count(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_derived_when_missing() {
        let usage = Usage::new(10, 5, None);
        assert_eq!(usage.total_tokens, 15);

        let usage = Usage::new(10, 5, Some(20));
        assert_eq!(usage.total_tokens, 20);
    }

    #[test]
    fn merge_split_reports() {
        let mut usage = Usage::new(120, 0, None);
        usage.merge(&Usage::new(0, 30, None));
        assert_eq!(usage, Usage::new(120, 30, Some(150)));
    }

    #[test]
    fn counts_saturate() {
        let usage = Usage::new(u32::MAX, 10, None);
        assert_eq!(usage.total_tokens, u32::MAX);

        let mut merged = Usage::new(u32::MAX - 1, 0, None);
        merged.merge(&Usage::new(0, 5, None));
        assert_eq!(merged.total_tokens, u32::MAX);

        assert_eq!(clamp_count(7), 7);
        assert_eq!(clamp_count(u64::from(u32::MAX) + 1), u32::MAX);
    }
}
