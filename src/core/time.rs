use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, PrimitiveDateTime};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}

pub(crate) fn seconds_between(earlier: PrimitiveDateTime, later: PrimitiveDateTime) -> f64 {
    (later.assume_utc() - earlier.assume_utc()).as_seconds_f64()
}

pub(crate) fn add_seconds(value: PrimitiveDateTime, seconds: u64) -> PrimitiveDateTime {
    value.saturating_add(Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Date, Time};

    fn sample() -> PrimitiveDateTime {
        let date = Date::from_calendar_date(2025, time::Month::January, 2).unwrap();
        let time = Time::from_hms(10, 20, 30).unwrap();
        PrimitiveDateTime::new(date, time)
    }

    #[test]
    fn format_primitive_outputs_utc_z() {
        assert_eq!(format_primitive(sample()), "2025-01-02T10:20:30Z");
    }

    #[test]
    fn add_seconds_moves_forward() {
        let later = add_seconds(sample(), 90);
        assert_eq!(format_primitive(later), "2025-01-02T10:22:00Z");
        assert_eq!(seconds_between(sample(), later), 90.0);
    }
}
