// =============================================================================
// Exchange error parser — numeric codes + message fragments into the taxonomy
// =============================================================================
//
// Error bodies look like `{"code": -2019, "msg": "Margin is insufficient."}`.
// Known codes map to specific variants; unrecognised bodies become the
// EXCHANGE_REJECTED catch-all. The parser is deliberately defensive about
// shape: a missing code or msg still yields a usable error.
// =============================================================================

use crate::errors::GatewayError;

/// Map an exchange error body to a structured [`GatewayError`].
pub fn parse_exchange_error(body: &serde_json::Value) -> GatewayError {
    let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    let msg = body
        .get("msg")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    classify(code, &msg)
}

/// Classification by code first, message fragment second.
pub fn classify(code: i64, msg: &str) -> GatewayError {
    let lower = msg.to_ascii_lowercase();

    // Ban errors carry the expiry inside the message text.
    if code == -1003 || lower.contains("banned until") {
        if let Some(until_ms) = parse_ban_until(&lower) {
            return GatewayError::ExchangeBanned { until_ms };
        }
        return GatewayError::ExchangeRejected(msg.to_string());
    }

    match code {
        -4164 => return GatewayError::ExchangeMinNotional,
        -2019 => return GatewayError::ExchangeMarginInsufficient,
        -1111 => return GatewayError::ExchangePrecision,
        -2011 | -2013 => return GatewayError::ExchangeUnknownOrder,
        -4003 | -4005 => return GatewayError::ExchangeQtyTooSmall,
        -4016 | -4024 => return GatewayError::ExchangePriceFilter,
        -2022 | -2010 | -1013 | -4131 => {
            return GatewayError::ExchangeInvalidOrder(msg.to_string())
        }
        _ => {}
    }

    // Fall back to message fragments for codes we do not pin down.
    if lower.contains("notional") && lower.contains("smaller") {
        GatewayError::ExchangeMinNotional
    } else if lower.contains("margin is insufficient") {
        GatewayError::ExchangeMarginInsufficient
    } else if lower.contains("precision") {
        GatewayError::ExchangePrecision
    } else if lower.contains("unknown order") || lower.contains("order does not exist") {
        GatewayError::ExchangeUnknownOrder
    } else if lower.contains("quantity") && (lower.contains("less") || lower.contains("small")) {
        GatewayError::ExchangeQtyTooSmall
    } else if lower.contains("price_filter") || lower.contains("percent_price") {
        GatewayError::ExchangePriceFilter
    } else if lower.contains("reduceonly") || lower.contains("reduce only") {
        GatewayError::ExchangeInvalidOrder(msg.to_string())
    } else {
        GatewayError::ExchangeRejected(msg.to_string())
    }
}

/// Pull the millisecond timestamp out of "... banned until 1695123456789 ...".
fn parse_ban_until(lower_msg: &str) -> Option<i64> {
    let idx = lower_msg.find("banned until")?;
    let tail = &lower_msg[idx + "banned until".len()..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_specific_variants() {
        assert_eq!(classify(-4164, "Order's notional must be no smaller than 5"),
            GatewayError::ExchangeMinNotional);
        assert_eq!(classify(-2019, "Margin is insufficient."),
            GatewayError::ExchangeMarginInsufficient);
        assert_eq!(classify(-1111, "Precision is over the maximum defined for this asset."),
            GatewayError::ExchangePrecision);
        assert_eq!(classify(-2011, "Unknown order sent."),
            GatewayError::ExchangeUnknownOrder);
        assert_eq!(classify(-4003, "Quantity less than zero."),
            GatewayError::ExchangeQtyTooSmall);
        assert_eq!(classify(-4016, "Limit price can't be higher than 52618.29"),
            GatewayError::ExchangePriceFilter);
    }

    #[test]
    fn message_fragments_cover_unpinned_codes() {
        assert_eq!(classify(0, "Filter failure: PERCENT_PRICE"),
            GatewayError::ExchangePriceFilter);
        assert_eq!(classify(0, "Order does not exist."),
            GatewayError::ExchangeUnknownOrder);
        assert!(matches!(
            classify(-9999, "ReduceOnly Order is rejected."),
            GatewayError::ExchangeInvalidOrder(_)
        ));
    }

    #[test]
    fn unknown_errors_become_the_catch_all() {
        assert_eq!(
            classify(-1234, "something new"),
            GatewayError::ExchangeRejected("something new".to_string())
        );
    }

    #[test]
    fn ban_until_timestamp_is_extracted() {
        let e = classify(-1003, "Way too much request weight used; IP banned until 1695123456789.");
        assert_eq!(e, GatewayError::ExchangeBanned { until_ms: 1695123456789 });
    }

    #[test]
    fn parses_error_bodies() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient."});
        assert_eq!(parse_exchange_error(&body), GatewayError::ExchangeMarginInsufficient);
        let body = serde_json::json!({"msg": "weird"});
        assert_eq!(parse_exchange_error(&body), GatewayError::ExchangeRejected("weird".into()));
    }
}
