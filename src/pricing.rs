//! USD valuation from constant-product AMM pair reserves.
//!
//! A token is priced against a quote asset (normally wrapped ether) through the
//! pair holding both, then converted to USD with the quote asset's reference
//! price. Pricing never fails outward: a pair that cannot be interpreted values
//! its token at zero and the remaining tokens are priced as usual.

use crate::batch::{BatchRequest, BatchResponse, Slot};
use crate::contracts::IUniswapV2Pair;
use crate::tokens::{TokenBalance, TokenDescriptor};
use alloy_primitives::aliases::U112;
use alloy_primitives::{Address, U256, U512};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Fractional digits carried by the fixed-point mid-price before it is
/// converted to a `Decimal`.
const MID_PRICE_SCALE: u32 = 24;

/// Largest scale a `Decimal` can represent.
const MAX_DECIMAL_SCALE: u32 = 28;

/// Largest mantissa a `Decimal` can represent (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PriceError {
    #[error("pair {pair:?} does not hold exactly the priced token and the quote token")]
    UnmatchedPair { pair: Address },
    #[error("pair {pair:?} has an empty reserve")]
    ZeroReserve { pair: Address },
    #[error("arithmetic overflow while pricing")]
    Overflow,
    #[error("value does not fit a decimal")]
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairReserves {
    pub pair: Address,
    pub reserve0: U112,
    pub reserve1: U112,
    pub token0: Address,
    pub token1: Address,
    pub timestamp_last: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedToken {
    pub balance: TokenBalance,
    pub usd_unit_price: Decimal,
    pub usd_balance: Decimal,
}

impl PricedToken {
    pub fn unpriced(balance: TokenBalance) -> Self {
        Self {
            balance,
            usd_unit_price: Decimal::ZERO,
            usd_balance: Decimal::ZERO,
        }
    }
}

/// Calls scheduled to read one pair.
#[derive(Debug, Clone, Copy)]
pub struct PairSlots {
    pair: Address,
    reserves: Slot<IUniswapV2Pair::getReservesCall>,
    token0: Slot<IUniswapV2Pair::token0Call>,
    token1: Slot<IUniswapV2Pair::token1Call>,
}

impl PairSlots {
    pub fn schedule(request: &mut BatchRequest, pair: Address) -> Self {
        Self {
            pair,
            reserves: request.add(pair, IUniswapV2Pair::getReservesCall {}),
            token0: request.add(pair, IUniswapV2Pair::token0Call {}),
            token1: request.add(pair, IUniswapV2Pair::token1Call {}),
        }
    }

    /// `None` unless reserves and both token addresses were read.
    pub fn collect(&self, response: &BatchResponse) -> Option<PairReserves> {
        let reserves = response.decode(&self.reserves)?;
        Some(PairReserves {
            pair: self.pair,
            reserve0: reserves.reserve0,
            reserve1: reserves.reserve1,
            token0: response.decode(&self.token0)?,
            token1: response.decode(&self.token1)?,
            timestamp_last: reserves.blockTimestampLast,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PriceOracle {
    quote: TokenDescriptor,
    quote_usd_price: Decimal,
}

impl PriceOracle {
    pub fn new(quote: TokenDescriptor, quote_usd_price: Decimal) -> Self {
        Self {
            quote,
            quote_usd_price,
        }
    }

    pub fn quote(&self) -> &TokenDescriptor {
        &self.quote
    }

    /// Mid-price of `priced` expressed in the quote asset.
    ///
    /// `reserve_quote * 10^(priced decimals + 24) / (reserve_priced * 10^quote decimals)`,
    /// with the powers of ten cancelled against each other and the products held
    /// in 512 bits.
    pub fn mid_price(
        &self,
        reserves: &PairReserves,
        priced: &TokenDescriptor,
    ) -> Result<Decimal, PriceError> {
        let (reserve_quote, reserve_priced) = self.orient(reserves, priced)?;
        if reserve_quote.is_zero() || reserve_priced.is_zero() {
            return Err(PriceError::ZeroReserve {
                pair: reserves.pair,
            });
        }

        let scale = u32::from(priced.decimals) + MID_PRICE_SCALE;
        let quote_decimals = u32::from(self.quote.decimals);
        let numerator = U512::from(reserve_quote)
            .checked_mul(pow10(scale.saturating_sub(quote_decimals))?)
            .ok_or(PriceError::Overflow)?;
        let denominator = U512::from(reserve_priced)
            .checked_mul(pow10(quote_decimals.saturating_sub(scale))?)
            .ok_or(PriceError::Overflow)?;

        let quotient = numerator / denominator;
        if quotient > U512::from(U256::MAX) {
            return Err(PriceError::OutOfRange);
        }
        let price = to_decimal(U256::from(quotient), MID_PRICE_SCALE)?;
        Ok(price.normalize())
    }

    pub fn try_unit_price(
        &self,
        reserves: &PairReserves,
        priced: &TokenDescriptor,
    ) -> Result<Decimal, PriceError> {
        self.mid_price(reserves, priced)?
            .checked_mul(self.quote_usd_price)
            .ok_or(PriceError::Overflow)
    }

    /// USD price of one whole `priced` token, zero when the pair cannot price it.
    pub fn unit_price(&self, reserves: &PairReserves, priced: &TokenDescriptor) -> Decimal {
        match self.try_unit_price(reserves, priced) {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    "Cannot price {} from pair {:?}: {}",
                    priced.symbol, reserves.pair, e
                );
                Decimal::ZERO
            }
        }
    }

    /// Values a balance. Missing reserves or any pricing error yield zero USD
    /// figures for this token only.
    pub fn value(&self, balance: TokenBalance, reserves: Option<&PairReserves>) -> PricedToken {
        let Some(reserves) = reserves else {
            return PricedToken::unpriced(balance);
        };

        match self.try_value(&balance, reserves) {
            Ok((usd_unit_price, usd_balance)) => PricedToken {
                balance,
                usd_unit_price,
                usd_balance,
            },
            Err(e) => {
                warn!(
                    "Cannot value {} from pair {:?}: {}",
                    balance.token.symbol, reserves.pair, e
                );
                PricedToken::unpriced(balance)
            }
        }
    }

    fn try_value(
        &self,
        balance: &TokenBalance,
        reserves: &PairReserves,
    ) -> Result<(Decimal, Decimal), PriceError> {
        let unit_price = self.try_unit_price(reserves, &balance.token)?;
        let units = to_decimal(balance.raw_balance, u32::from(balance.token.decimals))?;
        let usd_balance = unit_price.checked_mul(units).ok_or(PriceError::Overflow)?;
        Ok((unit_price, usd_balance))
    }

    /// Returns (quote reserve, priced reserve) according to the pair's ordering.
    fn orient(
        &self,
        reserves: &PairReserves,
        priced: &TokenDescriptor,
    ) -> Result<(U256, U256), PriceError> {
        let quote = self.quote.address;
        let r0 = U256::from(reserves.reserve0);
        let r1 = U256::from(reserves.reserve1);

        if quote == priced.address {
            return Err(PriceError::UnmatchedPair {
                pair: reserves.pair,
            });
        }
        if reserves.token0 == quote && reserves.token1 == priced.address {
            Ok((r0, r1))
        } else if reserves.token0 == priced.address && reserves.token1 == quote {
            Ok((r1, r0))
        } else {
            Err(PriceError::UnmatchedPair {
                pair: reserves.pair,
            })
        }
    }
}

fn pow10(exponent: u32) -> Result<U512, PriceError> {
    U512::from(10u64)
        .checked_pow(U512::from(exponent))
        .ok_or(PriceError::Overflow)
}

/// Converts a fixed-point integer with `scale` fractional digits into a
/// `Decimal`, dropping low-order digits when it does not fit.
pub fn to_decimal(value: U256, scale: u32) -> Result<Decimal, PriceError> {
    let max_mantissa = U256::from(MAX_DECIMAL_MANTISSA);
    let ten = U256::from(10u64);
    let mut value = value;
    let mut scale = scale;

    while scale > MAX_DECIMAL_SCALE || (value > max_mantissa && scale > 0) {
        value /= ten;
        scale -= 1;
    }
    if value > max_mantissa {
        return Err(PriceError::OutOfRange);
    }

    let mantissa = i128::try_from(value.to::<u128>()).map_err(|_| PriceError::OutOfRange)?;
    Decimal::try_from_i128_with_scale(mantissa, scale).map_err(|_| PriceError::OutOfRange)
}
