// 💲 Amount formatting for CLI tables and API display fields

use rust_decimal::{Decimal, RoundingStrategy};

/// Display precision per currency (crypto only)
pub fn display_precision(currency: &str) -> u32 {
    match currency.to_uppercase().as_str() {
        "BTC" | "WBTC" => 8,
        "ETH" | "TRX" => 6,
        "USDT" | "USDC" | "DAI" => 2,
        _ => 8,
    }
}

fn fiat_symbol(currency: &str) -> Option<&'static str> {
    match currency.to_uppercase().as_str() {
        "USD" => Some("$"),
        "EUR" => Some("€"),
        _ => None,
    }
}

/// "1234567" -> "1,234,567"
fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Split a non-negative decimal's text into grouped integer part and fraction
fn grouped(abs: Decimal) -> String {
    let text = abs.to_string();
    match text.split_once('.') {
        Some((int, frac)) => format!("{}.{}", group_thousands(int), frac),
        None => group_thousands(&text),
    }
}

/// `$1,234.56`, `€10.00`, `0.5 BTC`, `1,000 USDT`
pub fn format_amount(amount: Decimal, currency: &str) -> String {
    let symbol = fiat_symbol(currency);
    let precision = if symbol.is_some() { 2 } else { display_precision(currency) };
    let mut rounded = amount.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero);
    // Sign follows what is displayed: -0.001 USD is "$0.00"
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };

    match symbol {
        Some(symbol) => {
            rounded.rescale(2);
            format!("{}{}{}", sign, symbol, grouped(rounded.abs()))
        }
        None => format!("{}{} {}", sign, grouped(rounded.abs().normalize()), currency.to_uppercase()),
    }
}

/// P&L column: `+$12.00`, `-$3.50`, `$0.00`
pub fn format_signed_usd(amount: Decimal) -> String {
    let formatted = format_amount(amount, "USD");
    // Same rounding as format_amount, so the sign matches the digits
    if amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero) > Decimal::ZERO {
        format!("+{}", formatted)
    } else {
        formatted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fiat() {
        assert_eq!(format_amount(dec!(1234.5), "USD"), "$1,234.50");
        assert_eq!(format_amount(dec!(1234567.891), "usd"), "$1,234,567.89");
        assert_eq!(format_amount(dec!(0.005), "EUR"), "€0.01");
        assert_eq!(format_amount(dec!(-42), "USD"), "-$42.00");
        assert_eq!(format_amount(dec!(999), "USD"), "$999.00");
        assert_eq!(format_amount(dec!(-0.001), "USD"), "$0.00");
    }

    #[test]
    fn test_crypto_precision_and_trimming() {
        assert_eq!(format_amount(dec!(0.50000000), "BTC"), "0.5 BTC");
        assert_eq!(format_amount(dec!(0.123456789), "BTC"), "0.12345679 BTC");
        assert_eq!(format_amount(dec!(1.23456789), "eth"), "1.234568 ETH");
        assert_eq!(format_amount(dec!(25000.129), "USDT"), "25,000.13 USDT");
        assert_eq!(format_amount(dec!(1000.00), "USDC"), "1,000 USDC");
        assert_eq!(format_amount(Decimal::ZERO, "BTC"), "0 BTC");
    }

    #[test]
    fn test_signed_usd() {
        assert_eq!(format_signed_usd(dec!(12)), "+$12.00");
        assert_eq!(format_signed_usd(dec!(-3.5)), "-$3.50");
        assert_eq!(format_signed_usd(Decimal::ZERO), "$0.00");
        assert_eq!(format_signed_usd(dec!(0.001)), "$0.00");
        assert_eq!(format_signed_usd(dec!(0.005)), "+$0.01");
        assert_eq!(format_signed_usd(dec!(0.015)), "+$0.02");
        assert_eq!(format_signed_usd(dec!(-0.005)), "-$0.01");
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands("1"), "1");
        assert_eq!(group_thousands("123"), "123");
        assert_eq!(group_thousands("1234"), "1,234");
        assert_eq!(group_thousands("123456"), "123,456");
    }
}
