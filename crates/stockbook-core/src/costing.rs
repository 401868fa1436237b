use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{LedgerError, LedgerResult};

/// Decimal places carried by unit costs and values.
pub const COST_SCALE: u32 = 4;

pub fn round_cost(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Rounded value of `quantity` units at `unit_cost`.
pub fn line_cost(quantity: i64, unit_cost: Decimal) -> LedgerResult<Decimal> {
    add_value(Decimal::ZERO, quantity, unit_cost).map(round_cost)
}

/// Adds the unrounded value of `quantity` units at `unit_cost` to `total`.
pub fn add_value(total: Decimal, quantity: i64, unit_cost: Decimal) -> LedgerResult<Decimal> {
    Decimal::from(quantity)
        .checked_mul(unit_cost)
        .and_then(|value| total.checked_add(value))
        .ok_or_else(value_overflow)
}

fn value_overflow() -> LedgerError {
    LedgerError::invalid("value exceeds the supported cost range")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendedCost {
    pub quantity: i64,
    pub unit_cost: Decimal,
    /// Value in minus value out after rounding the unit cost.
    pub residue: Decimal,
}

/// Quantity-weighted unit cost of `(quantity, unit_cost)` lots.
pub fn blend<I>(lots: I) -> LedgerResult<BlendedCost>
where
    I: IntoIterator<Item = (i64, Decimal)>,
{
    let mut quantity = 0_i64;
    let mut value = Decimal::ZERO;
    for (lot_quantity, lot_cost) in lots {
        quantity = quantity
            .checked_add(lot_quantity)
            .ok_or_else(|| LedgerError::invalid("combined quantity is out of range"))?;
        value = add_value(value, lot_quantity, lot_cost)?;
    }

    if quantity <= 0 {
        return Err(LedgerError::invalid("nothing to blend"));
    }
    spread(value, quantity)
}

/// Spreads a total value over `quantity` units.
pub fn spread(value: Decimal, quantity: i64) -> LedgerResult<BlendedCost> {
    if quantity <= 0 {
        return Err(LedgerError::invalid("quantity must be positive"));
    }
    let unit_cost = round_cost(value / Decimal::from(quantity));
    let spread_value = add_value(Decimal::ZERO, quantity, unit_cost)?;
    Ok(BlendedCost {
        quantity,
        unit_cost,
        residue: value.checked_sub(spread_value).ok_or_else(value_overflow)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_weights_by_quantity() {
        let blended = blend([(10, Decimal::new(5, 0)), (30, Decimal::new(9, 0))]).unwrap();
        assert_eq!(blended.quantity, 40);
        assert_eq!(blended.unit_cost, Decimal::new(8, 0));
        assert_eq!(blended.residue, Decimal::ZERO);
    }

    #[test]
    fn blend_reports_rounding_residue() {
        // 1 @ 1.00 + 2 @ 2.00 = 5.00 over 3 units
        let blended = blend([(1, Decimal::new(100, 2)), (2, Decimal::new(200, 2))]).unwrap();
        assert_eq!(blended.unit_cost, Decimal::new(16667, 4));
        assert_eq!(blended.residue, Decimal::new(-1, 4));
    }

    #[test]
    fn blend_of_nothing_is_rejected() {
        assert!(matches!(
            blend(std::iter::empty()),
            Err(LedgerError::InvalidMovement(_))
        ));
        assert!(matches!(
            blend([(0, Decimal::ONE)]),
            Err(LedgerError::InvalidMovement(_))
        ));
    }

    #[test]
    fn rounding_is_bankers() {
        assert_eq!(round_cost(Decimal::new(125, 5)), Decimal::new(12, 4));
        assert_eq!(round_cost(Decimal::new(135, 5)), Decimal::new(14, 4));
    }

    #[test]
    fn oversized_values_are_errors() {
        let huge = Decimal::new(100_000_000_000, 0);
        assert!(matches!(
            line_cost(i64::MAX, huge),
            Err(LedgerError::InvalidMovement(_))
        ));
        assert!(matches!(
            blend([(i64::MAX, Decimal::ONE), (1, Decimal::ONE)]),
            Err(LedgerError::InvalidMovement(_))
        ));
        assert!(add_value(Decimal::MAX, 1, Decimal::ONE).is_err());
        assert_eq!(
            line_cost(3, Decimal::new(12345, 4)).unwrap(),
            Decimal::new(37035, 4)
        );
    }
}
