//! Per-token pricing for known models.

use rust_decimal::Decimal;

/// US cents per million tokens: (model prefix, input, output).
const PRICES_PER_MTOK: &[(&str, i64, i64)] = &[
    ("claude-3-5-haiku", 80, 400),
    ("claude-3-5-sonnet", 300, 1500),
    ("claude-sonnet-4", 300, 1500),
    ("claude-opus-4", 1500, 7500),
    ("gpt-4o-mini", 15, 60),
    ("gpt-4o", 250, 1000),
    ("gpt-4.1-mini", 40, 160),
    ("gpt-4.1", 200, 800),
];

/// (input, output) cost per token. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    // cents per Mtok at scale 8 is USD per token
    PRICES_PER_MTOK
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (Decimal::new(*input, 8), Decimal::new(*output, 8)))
        .unwrap_or((Decimal::ZERO, Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn known_model_prefix() {
        let (input, output) = model_cost("claude-3-5-sonnet-latest");
        assert_eq!(input, Decimal::from_str("0.000003").unwrap());
        assert_eq!(output, Decimal::from_str("0.000015").unwrap());
    }

    #[test]
    fn mini_matches_before_full_model() {
        let (input, _) = model_cost("gpt-4o-mini-2024-07-18");
        assert_eq!(input, Decimal::from_str("0.00000015").unwrap());
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(model_cost("local-llama"), (Decimal::ZERO, Decimal::ZERO));
    }
}
