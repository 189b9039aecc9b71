use std::fmt;

/// Amounts are integer minor currency units (pence, cents). 1 major unit = 100
/// minor units, so £80.00 = 8000.
pub type Minor = i64;

/// Largest magnitude accepted for a single ledger entry (£100,000,000.00).
pub const MAX_ENTRY_AMOUNT: Minor = 10_000_000_000;

/// Format minor units as a major-unit string.
/// Example: 8000 -> "80.00", -350 -> "-3.50"
pub fn format_minor(amount: Minor) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a major-unit string into minor units.
///
/// Accepts "80", "80.5" and "80.50". More than two decimal places is an error.
pub fn parse_minor(input: &str) -> Result<Minor, ParseAmountError> {
    let input = input.trim();
    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    if digits.is_empty() {
        return Err(ParseAmountError::Empty);
    }

    let (units_str, fraction_str) = digits.split_once('.').unwrap_or((digits, ""));
    if !units_str.chars().all(|c| c.is_ascii_digit())
        || !fraction_str.chars().all(|c| c.is_ascii_digit())
        || (units_str.is_empty() && fraction_str.is_empty())
    {
        return Err(ParseAmountError::InvalidFormat);
    }

    let fraction: i64 = match fraction_str.len() {
        0 => 0,
        1 => fraction_str.parse::<i64>().map_err(|_| ParseAmountError::InvalidFormat)? * 10,
        2 => fraction_str.parse().map_err(|_| ParseAmountError::InvalidFormat)?,
        _ => return Err(ParseAmountError::TooPrecise),
    };
    let units: i64 = if units_str.is_empty() {
        0
    } else {
        units_str.parse().map_err(|_| ParseAmountError::Overflow)?
    };

    let amount = units
        .checked_mul(100)
        .and_then(|v| v.checked_add(fraction))
        .ok_or(ParseAmountError::Overflow)?;
    Ok(if negative { -amount } else { amount })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAmountError {
    Empty,
    InvalidFormat,
    TooPrecise,
    Overflow,
}

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAmountError::Empty => write!(f, "amount is empty"),
            ParseAmountError::InvalidFormat => write!(f, "invalid money format"),
            ParseAmountError::TooPrecise => write!(f, "at most two decimal places are allowed"),
            ParseAmountError::Overflow => write!(f, "amount is too large"),
        }
    }
}

impl std::error::Error for ParseAmountError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(8000), "80.00");
        assert_eq!(format_minor(3500), "35.00");
        assert_eq!(format_minor(1), "0.01");
        assert_eq!(format_minor(0), "0.00");
        assert_eq!(format_minor(-350), "-3.50");
    }

    #[test]
    fn test_parse_minor() {
        assert_eq!(parse_minor("80"), Ok(8000));
        assert_eq!(parse_minor("80.00"), Ok(8000));
        assert_eq!(parse_minor("12.5"), Ok(1250));
        assert_eq!(parse_minor(".50"), Ok(50));
        assert_eq!(parse_minor(" 0.01 "), Ok(1));
        assert_eq!(parse_minor("-3.50"), Ok(-350));
    }

    #[test]
    fn test_parse_minor_rejects_bad_input() {
        assert_eq!(parse_minor(""), Err(ParseAmountError::Empty));
        assert_eq!(parse_minor("abc"), Err(ParseAmountError::InvalidFormat));
        assert_eq!(parse_minor("1.2.3"), Err(ParseAmountError::InvalidFormat));
        assert_eq!(parse_minor("."), Err(ParseAmountError::InvalidFormat));
        assert_eq!(parse_minor("+5"), Err(ParseAmountError::InvalidFormat));
        assert_eq!(parse_minor("10.999"), Err(ParseAmountError::TooPrecise));
        assert_eq!(
            parse_minor("99999999999999999999"),
            Err(ParseAmountError::Overflow)
        );
    }
}
