//! Cost estimation for AI provider usage.
//!
//! Rates are sourced from publicly listed pricing pages and kept as
//! constants here. They must be updated when provider pricing changes.
//!
//! All rates are expressed as USD per 1 000 000 tokens.

/// Per-million-token rates for one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

const fn rates(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Rates {
    Rates {
        input,
        output,
        cache_read,
        cache_write,
    }
}

/// Look up rates for a model identifier.
///
/// The model string may be a full API model name (e.g.
/// `"claude-sonnet-4-5-20250929"`) or a short alias. Unknown models return
/// `None` — callers emit a zero cost with `ai.cost.known = false` rather
/// than guessing, so aggregates are never silently inflated.
pub fn lookup(model: &str) -> Option<Rates> {
    let m = model.to_lowercase();

    if m.contains("claude-opus-4") || m.contains("opus-4") {
        return Some(rates(15.0, 75.0, 1.50, 18.75));
    }
    if m.contains("claude-sonnet-4") || m.contains("sonnet-4") {
        return Some(rates(3.0, 15.0, 0.30, 3.75));
    }
    if m.contains("claude-haiku-4") || m.contains("haiku-4") {
        return Some(rates(1.0, 5.0, 0.10, 1.25));
    }
    if m.contains("claude-3-5-haiku") || m.contains("haiku-3-5") {
        return Some(rates(0.80, 4.0, 0.08, 1.0));
    }
    if m.contains("claude-3-7-sonnet") || m.contains("claude-3-5-sonnet") {
        return Some(rates(3.0, 15.0, 0.30, 3.75));
    }
    if m.contains("claude-3-opus") {
        return Some(rates(15.0, 75.0, 1.50, 18.75));
    }
    if m.contains("claude-3-haiku") {
        return Some(rates(0.25, 1.25, 0.03, 0.30));
    }

    None
}

/// Token counts consumed by one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// Total cost in USD for one call under the given rates.
pub fn cost_usd(tokens: TokenCounts, rates: Rates) -> f64 {
    (tokens.input as f64 * rates.input
        + tokens.output as f64 * rates.output
        + tokens.cache_read as f64 * rates.cache_read
        + tokens.cache_write as f64 * rates.cache_write)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_zero_cost() {
        let r = lookup("claude-sonnet-4-5").unwrap();
        assert_eq!(cost_usd(TokenCounts::default(), r), 0.0);
    }

    #[test]
    fn known_model_rates() {
        let r = lookup("claude-opus-4-1-20250805").unwrap();
        assert!(r.input > 0.0);
        assert!(r.output > r.input); // output always more expensive than input
        assert!(r.cache_read < r.input);
        assert!(r.cache_write > r.input);
    }

    #[test]
    fn unknown_model_returns_none() {
        assert!(lookup("some-future-model-9").is_none());
        assert!(lookup("gpt-4o").is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("Claude-Sonnet-4-5"), lookup("claude-sonnet-4-5"));
    }

    #[test]
    fn cost_sums_all_four_kinds() {
        let r = rates(1.0, 2.0, 0.5, 4.0);
        let tokens = TokenCounts {
            input: 1_000_000,
            output: 500_000,
            cache_read: 2_000_000,
            cache_write: 250_000,
        };
        let expected = 1.0 + 1.0 + 1.0 + 1.0;
        assert!((cost_usd(tokens, r) - expected).abs() < 1e-9);
    }

    #[test]
    fn spec_example_cost() {
        // 100 input + 50 output on a known model, to within 1e-9.
        let r = lookup("claude-sonnet-4-5").unwrap();
        let tokens = TokenCounts {
            input: 100,
            output: 50,
            ..Default::default()
        };
        let expected = 100.0 * r.input / 1e6 + 50.0 * r.output / 1e6;
        assert!((cost_usd(tokens, r) - expected).abs() < 1e-9);
    }
}
