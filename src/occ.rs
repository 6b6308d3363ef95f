//! OCC option symbol codec (C2).
//!
//! A 21-character OCC symbol is purely positional:
//! `ROOT(6) YYMMDD(6) C|P(1) STRIKE*1000(8)`. The root is left-justified and
//! space-padded; the strike is the dollar strike times 1000, zero-padded to
//! eight digits. Encode/decode must round-trip exactly, padding included,
//! since the broker compares these strings byte-for-byte (L1 in spec §8).

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ROOT_LEN: usize = 6;
const DATE_LEN: usize = 6;
const TYPE_LEN: usize = 1;
const STRIKE_LEN: usize = 8;
const TOTAL_LEN: usize = ROOT_LEN + DATE_LEN + TYPE_LEN + STRIKE_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OccError {
    #[error("OCC symbol must be {TOTAL_LEN} characters, got {0}")]
    WrongLength(usize),
    #[error("invalid expiration date in OCC symbol: {0}")]
    BadDate(String),
    #[error("invalid option type character: {0}")]
    BadType(char),
    #[error("invalid strike digits: {0}")]
    BadStrike(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    fn as_char(self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

/// A decoded OCC symbol. `root` retains its original trailing padding so
/// that `format()` reproduces the exact broker-issued string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub strike: Decimal,
}

impl OccSymbol {
    pub fn parse(raw: &str) -> Result<Self, OccError> {
        if raw.len() != TOTAL_LEN {
            return Err(OccError::WrongLength(raw.len()));
        }
        let bytes = raw.as_bytes();
        debug_assert!(bytes.is_ascii());

        let root = raw[0..ROOT_LEN].to_string();
        let date_str = &raw[ROOT_LEN..ROOT_LEN + DATE_LEN];
        let type_char = raw.as_bytes()[ROOT_LEN + DATE_LEN] as char;
        let strike_str = &raw[ROOT_LEN + DATE_LEN + TYPE_LEN..];

        let expiration = NaiveDate::parse_from_str(date_str, "%y%m%d")
            .map_err(|_| OccError::BadDate(date_str.to_string()))?;

        let option_type = match type_char {
            'C' => OptionType::Call,
            'P' => OptionType::Put,
            c => return Err(OccError::BadType(c)),
        };

        let strike_millis: i64 = strike_str
            .parse()
            .map_err(|_| OccError::BadStrike(strike_str.to_string()))?;
        let strike = Decimal::new(strike_millis, 3);

        Ok(OccSymbol {
            root,
            expiration,
            option_type,
            strike,
        })
    }

    pub fn format(&self) -> String {
        let mut root = self.root.clone();
        if root.len() > ROOT_LEN {
            root.truncate(ROOT_LEN);
        } else {
            while root.len() < ROOT_LEN {
                root.push(' ');
            }
        }
        let date = self.expiration.format("%y%m%d").to_string();
        let strike_millis = (self.strike.round_dp(3) * Decimal::new(1000, 0))
            .round()
            .to_string()
            .parse::<i64>()
            .unwrap_or(0);
        let strike_part = format!("{:08}", strike_millis.unsigned_abs());
        format!(
            "{root}{date}{type_char}{strike_part}",
            type_char = self.option_type.as_char()
        )
    }

    /// Root with padding trimmed, for display/underlying comparisons.
    pub fn root_trimmed(&self) -> &str {
        self.root.trim_end()
    }
}

impl fmt::Display for OccSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl FromStr for OccSymbol {
    type Err = OccError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OccSymbol::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trips_padded_root() {
        let raw = "SYM   250117C00455000";
        let parsed = OccSymbol::parse(raw).unwrap();
        assert_eq!(parsed.root_trimmed(), "SYM");
        assert_eq!(parsed.option_type, OptionType::Call);
        assert_eq!(parsed.strike, dec!(455.000));
        assert_eq!(parsed.format(), raw);
    }

    #[test]
    fn round_trips_six_char_root() {
        let raw = "SPXW  250117P04500000";
        // SPXW with two trailing spaces is already 6 chars.
        let parsed = OccSymbol::parse(raw).unwrap();
        assert_eq!(parsed.format(), raw);
    }

    #[test]
    fn fractional_strike() {
        let raw = "AAPL  250620P00150500";
        let parsed = OccSymbol::parse(raw).unwrap();
        assert_eq!(parsed.strike, dec!(150.500));
        assert_eq!(parsed.format(), raw);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(OccSymbol::parse("TOO_SHORT"), Err(OccError::WrongLength(9)));
    }

    #[test]
    fn bad_type_char_is_rejected() {
        let raw = "SYM   250117X00455000";
        assert!(matches!(OccSymbol::parse(raw), Err(OccError::BadType('X'))));
    }
}
