use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, Month, OffsetDateTime, Time};

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// RFC 3339 string for persisted timestamp fields.
pub fn now_rfc3339() -> String {
    now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| now_utc().unix_timestamp().to_string())
}

pub fn unix_millis() -> u64 {
    let now = now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as u64
}

/// UTC calendar date as `YYYY-MM-DD`, the partition key for usage stats.
pub fn today_utc() -> String {
    format_date(now_utc().date())
}

pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn days_ago_utc(days: i64) -> String {
    format_date((now_utc() - Duration::days(days)).date())
}

/// Midnight UTC on the first day of the month after `from`.
pub fn first_of_next_month(from: OffsetDateTime) -> OffsetDateTime {
    let date = from.date();
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        month => (date.year(), month.next()),
    };
    let first = Date::from_calendar_date(year, month, 1).unwrap_or(date);
    OffsetDateTime::new_utc(first, Time::MIDNIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn next_month_rolls_within_year() {
        let from = datetime!(2026-03-15 10:30:00 UTC);
        let next = first_of_next_month(from);
        assert_eq!(next, datetime!(2026-04-01 00:00:00 UTC));
    }

    #[test]
    fn next_month_rolls_over_december() {
        let from = datetime!(2026-12-31 23:59:59 UTC);
        let next = first_of_next_month(from);
        assert_eq!(next, datetime!(2027-01-01 00:00:00 UTC));
    }

    #[test]
    fn date_format_is_iso_calendar() {
        let date = datetime!(2026-02-03 00:00:00 UTC).date();
        assert_eq!(format_date(date), "2026-02-03");
    }
}
