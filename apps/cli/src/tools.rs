//! Built-in demo capabilities available to every CLI pipeline.

use serde_json::{Value, json};
use toolpipe_core::{Capability, ToolRegistry};

const DEMO_BALANCE: u64 = 1000;

/// Registry holding `fetch_crypto_data`, `format_crypto_output`,
/// `address_to_symbol`, and `uppercase`.
pub(crate) fn builtin_registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(Capability::from_fn("fetch_crypto_data", fetch_crypto_data))
        .with(Capability::from_fn("format_crypto_output", format_crypto_output))
        .with(Capability::from_fn("address_to_symbol", address_to_symbol))
        .with(Capability::from_fn("uppercase", uppercase))
}

/// Pull the first `0x…` token out of a free-text request, or use the whole input.
fn fetch_crypto_data(input: Value) -> Value {
    let address = match &input {
        Value::String(s) => s
            .split_whitespace()
            .find(|w| w.starts_with("0x"))
            .unwrap_or(s.as_str())
            .to_string(),
        other => other.to_string(),
    };
    json!({
        "address": address,
        "balance": DEMO_BALANCE,
        "name": "Unknown Token",
    })
}

fn format_crypto_output(data: Value) -> Value {
    let label = data
        .get("symbol")
        .or_else(|| data.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    let balance = data.get("balance").cloned().unwrap_or(json!(0));
    json!(format!("Token: {label} | Balance: {balance}"))
}

/// Attach a symbol to an address record; a bare address is wrapped first.
fn address_to_symbol(data: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("symbol".into(), json!("ETH"));
            Value::Object(map)
        }
        other => json!({ "address": other, "symbol": "ETH" }),
    }
}

fn uppercase(data: Value) -> Value {
    match data {
        Value::String(s) => Value::String(s.to_uppercase()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x1234567890abcdef1234567890abcdef12345678";

    #[test]
    fn fetch_finds_address_in_request() {
        let out = fetch_crypto_data(json!(format!("balance of {ADDRESS} please")));
        assert_eq!(out["address"], json!(ADDRESS));
        assert_eq!(out["balance"], json!(1000));
    }

    #[test]
    fn format_prefers_symbol() {
        let with_symbol = address_to_symbol(fetch_crypto_data(json!(ADDRESS)));
        assert_eq!(
            format_crypto_output(with_symbol),
            json!("Token: ETH | Balance: 1000")
        );
        assert_eq!(
            format_crypto_output(json!({"name": "Foo", "balance": 5})),
            json!("Token: Foo | Balance: 5")
        );
    }

    #[test]
    fn symbol_wraps_bare_address() {
        assert_eq!(
            address_to_symbol(json!(ADDRESS)),
            json!({"address": ADDRESS, "symbol": "ETH"})
        );
    }

    #[test]
    fn registry_lists_all_tools() {
        assert_eq!(
            builtin_registry().names(),
            vec![
                "address_to_symbol",
                "fetch_crypto_data",
                "format_crypto_output",
                "uppercase"
            ]
        );
    }
}
