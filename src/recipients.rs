use alloy_primitives::{Address, U256};
use regex::Regex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::LazyLock;

/// `<address><separator><amount>`, where the separator is a run of blanks or a
/// single `,` `=` `;` optionally padded with blanks.
static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<address>[^\s,=;]+)",
        r"(?:[ \t]*[,=;][ \t]*|[ \t]+)",
        r"(?P<amount>[^\s,=;]+)$"
    ))
    .expect("recipient line pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("not a decimal number")]
    NotANumber,
    #[error("more than {0} fractional digits")]
    TooManyDecimals(u8),
    #[error("does not fit in 256 bits")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format at line {line}")]
    InvalidFormat { line: usize },
    #[error("Invalid address at line {line}: {address}")]
    InvalidAddress { line: usize, address: String },
    #[error("Invalid amount at line {line}: {amount} ({reason})")]
    InvalidAmount {
        line: usize,
        amount: String,
        reason: AmountError,
    },
    #[error("Total amount overflows 256 bits")]
    TotalOverflow,
    #[error("No recipients given")]
    Empty,
}

impl ParseError {
    /// 1-based line the error refers to, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            ParseError::InvalidFormat { line }
            | ParseError::InvalidAddress { line, .. }
            | ParseError::InvalidAmount { line, .. } => Some(*line),
            ParseError::TotalOverflow | ParseError::Empty => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientInstruction {
    pub address: Address,
    pub amount: U256,
}

/// An immutable, ordered set of transfers whose total always equals the sum of
/// its amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distribution {
    instructions: Vec<RecipientInstruction>,
    total: U256,
}

impl Distribution {
    pub fn new(instructions: Vec<RecipientInstruction>) -> Result<Self, ParseError> {
        if instructions.is_empty() {
            return Err(ParseError::Empty);
        }
        let total = instructions
            .iter()
            .try_fold(U256::ZERO, |acc, i| acc.checked_add(i.amount))
            .ok_or(ParseError::TotalOverflow)?;
        Ok(Self {
            instructions,
            total,
        })
    }

    pub fn instructions(&self) -> &[RecipientInstruction] {
        &self.instructions
    }

    pub fn total(&self) -> U256 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn recipients(&self) -> Vec<Address> {
        self.instructions.iter().map(|i| i.address).collect()
    }

    pub fn amounts(&self) -> Vec<U256> {
        self.instructions.iter().map(|i| i.amount).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecipientParser {
    decimals: u8,
}

impl RecipientParser {
    pub fn new(decimals: u8) -> Self {
        Self { decimals }
    }

    /// Parses every non-blank line. Any bad line rejects the whole input.
    pub fn parse(&self, text: &str) -> Result<Distribution, ParseError> {
        let mut instructions = Vec::new();
        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            instructions.push(self.parse_line(index + 1, line)?);
        }
        Distribution::new(instructions)
    }

    fn parse_line(
        &self,
        line_number: usize,
        line: &str,
    ) -> Result<RecipientInstruction, ParseError> {
        let captures = LINE_PATTERN
            .captures(line)
            .ok_or(ParseError::InvalidFormat { line: line_number })?;
        let raw_address = &captures["address"];
        let raw_amount = &captures["amount"];

        let address = validate_address(raw_address).ok_or_else(|| ParseError::InvalidAddress {
            line: line_number,
            address: raw_address.to_string(),
        })?;
        let invalid_amount = |reason| ParseError::InvalidAmount {
            line: line_number,
            amount: raw_amount.to_string(),
            reason,
        };
        let amount = scale_amount(raw_amount, self.decimals).map_err(invalid_amount)?;

        Ok(RecipientInstruction { address, amount })
    }
}

/// Accepts `0x`-prefixed 40-digit hex. Mixed-case input must carry a valid
/// EIP-55 checksum.
pub fn validate_address(raw: &str) -> Option<Address> {
    let hex = raw.strip_prefix("0x")?;
    if hex.len() != 40 {
        return None;
    }
    let address = Address::from_str(raw).ok()?;

    let has_lower = hex.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && address.to_checksum(None) != raw {
        return None;
    }
    Some(address)
}

/// Scales a decimal string to base units without any rounding.
pub fn scale_amount(raw: &str, decimals: u8) -> Result<U256, AmountError> {
    let (integer, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (integer.is_empty() && fraction.is_empty()) || !all_digits(integer) || !all_digits(fraction)
    {
        return Err(AmountError::NotANumber);
    }
    if fraction.len() > usize::from(decimals) {
        return Err(AmountError::TooManyDecimals(decimals));
    }

    let padding = "0".repeat(usize::from(decimals) - fraction.len());
    let digits = format!("{integer}{fraction}{padding}");
    U256::from_str_radix(&digits, 10).map_err(|_| AmountError::Overflow)
}
