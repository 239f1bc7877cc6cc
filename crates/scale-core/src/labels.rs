//! # Label Dates
//!
//! Scales print a manufacture date and a sell-by date on every label. For
//! fresh goods both move forward daily: made today, sell by today plus the
//! product's shelf life. [`relabel`] computes that refresh without touching
//! anything else in the record.

use chrono::{Days, NaiveDate};

use crate::error::{CoreError, CoreResult};
use crate::types::Product;

/// Date format printed on labels and used by scale firmware (`31-12-25`).
pub const LABEL_DATE_FORMAT: &str = "%d-%m-%y";

/// Returns the products whose label dates change when relabelled for `today`.
///
/// Each returned product has `manufacture_date = today` and
/// `sell_by_date = today + shelf_life_days` (a missing shelf life counts as
/// zero days). Products already carrying those dates are left out, so the
/// result is exactly the set that needs pushing.
pub fn relabel(products: &[Product], today: NaiveDate) -> CoreResult<Vec<Product>> {
    let mut changed = Vec::new();

    for product in products {
        let days = product.shelf_life_days.unwrap_or(0);
        let sell_by = today
            .checked_add_days(Days::new(days as u64))
            .ok_or(CoreError::DateOverflow { date: today, days })?;

        if product.manufacture_date == Some(today) && product.sell_by_date == Some(sell_by) {
            continue;
        }

        let mut updated = product.clone();
        updated.manufacture_date = Some(today);
        updated.sell_by_date = Some(sell_by);
        changed.push(updated);
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::Plu;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn product(plu: u32, shelf_life: Option<u32>) -> Product {
        let mut p = Product::new(Plu::new(plu).unwrap(), "Milk", Money::from_cents(89));
        p.shelf_life_days = shelf_life;
        p
    }

    #[test]
    fn test_relabel_sets_dates() {
        let today = date(2025, 2, 27);
        let out = relabel(&[product(1, Some(3)), product(2, None)], today).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].manufacture_date, Some(today));
        assert_eq!(out[0].sell_by_date, Some(date(2025, 3, 2)));
        assert_eq!(out[1].sell_by_date, Some(today));
        assert_eq!(out[0].price, Money::from_cents(89));
    }

    #[test]
    fn test_relabel_skips_current_labels() {
        let today = date(2025, 2, 27);
        let mut fresh = product(1, Some(1));
        fresh.manufacture_date = Some(today);
        fresh.sell_by_date = Some(date(2025, 2, 28));

        let out = relabel(&[fresh, product(2, Some(1))], today).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].plu.get(), 2);
    }

    #[test]
    fn test_label_date_format() {
        assert_eq!(date(2025, 12, 31).format(LABEL_DATE_FORMAT).to_string(), "31-12-25");
    }
}
