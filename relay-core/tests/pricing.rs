use relay_core::pricing::PriceTable;
use relay_types::TokenUsage;
use rust_decimal::Decimal;

#[test]
fn longest_prefix_wins_and_unknown_models_use_the_default() {
    let table = PriceTable::default();
    let usage = TokenUsage {
        input_tokens: 1_000_000,
        output_tokens: 0,
        cache_read_input_tokens: 0,
        cache_creation_input_tokens: 0,
    };
    // One MTok of input on sonnet is exactly the listed rate.
    assert_eq!(
        table.cost("claude-sonnet-4-20250514", &usage),
        Decimal::from(3)
    );
    // Unknown models fall back to the default rate rather than billing zero.
    assert!(table.cost("totally-unknown-model", &usage) > Decimal::ZERO);
}

#[test]
fn cost_sums_all_four_token_kinds() {
    let table = PriceTable::default();
    let usage = TokenUsage {
        input_tokens: 1000,
        output_tokens: 2000,
        cache_read_input_tokens: 500,
        cache_creation_input_tokens: 400,
    };
    // sonnet: 3, 15, 0.3, 3.75 USD/MTok.
    let expected = Decimal::new(3, 3)
        + Decimal::new(30, 3)
        + Decimal::new(15, 5)
        + Decimal::new(150, 5);
    assert_eq!(table.cost("claude-sonnet-4", &usage), expected);
}

#[test]
fn streaming_usage_merge_keeps_cumulative_maxima() {
    let mut usage = TokenUsage {
        input_tokens: 1000,
        output_tokens: 3,
        ..TokenUsage::default()
    };
    usage.merge(&TokenUsage {
        input_tokens: 1000,
        output_tokens: 250,
        ..TokenUsage::default()
    });
    assert_eq!(usage.input_tokens, 1000);
    assert_eq!(usage.output_tokens, 250);
}
