use serde::{Deserialize, Serialize};

/// Token accounting for one request, including prompt-cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold a partial usage object into this one. Streaming deltas only carry
    /// the counters they update, so zero fields never overwrite known values
    /// except `output_tokens`, which the API re-states as a running total.
    pub fn merge_delta(&mut self, delta: &PartialUsage) {
        if let Some(v) = delta.input_tokens {
            self.input_tokens = v;
        }
        if let Some(v) = delta.output_tokens {
            self.output_tokens = v;
        }
        if let Some(v) = delta.cache_creation_input_tokens {
            self.cache_creation_input_tokens = v;
        }
        if let Some(v) = delta.cache_read_input_tokens {
            self.cache_read_input_tokens = v;
        }
    }
}

/// Usage object as it appears inside streaming events, all fields optional.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PartialUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_known_counters() {
        let mut usage = Usage {
            input_tokens: 5,
            cache_read_input_tokens: 12,
            ..Usage::default()
        };
        usage.merge_delta(&PartialUsage {
            output_tokens: Some(7),
            ..PartialUsage::default()
        });
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_input_tokens, 12);
        assert_eq!(usage.total(), 12);
    }
}
