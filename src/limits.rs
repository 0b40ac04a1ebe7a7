use chrono::NaiveDate;
use rust_decimal::Decimal;

pub const MAX_MESSAGE_LEN: usize = 2_000;
pub const MAX_CITY_LEN: usize = 100;
pub const MAX_STAY_NIGHTS: i64 = 365;
pub const MAX_BOOKINGS_PER_LISTING: usize = 10_000;
pub const MAX_LISTINGS: usize = 100_000;
pub const MAX_USERS: usize = 1_000_000;

/// Upper bound on a listing's nightly rate.
pub const MAX_DAILY_PRICE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

pub const MIN_VALID_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2000, 1, 1) {
    Some(d) => d,
    None => panic!("invalid MIN_VALID_DATE"),
};

pub const MAX_VALID_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2100, 1, 1) {
    Some(d) => d,
    None => panic!("invalid MAX_VALID_DATE"),
};
