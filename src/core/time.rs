use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn to_primitive_utc(value: OffsetDateTime) -> PrimitiveDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}

/// Whole seconds from `now` until `target`, never negative.
pub(crate) fn seconds_until(now: PrimitiveDateTime, target: PrimitiveDateTime) -> i64 {
    (target - now).whole_seconds().max(0)
}

/// `std` duration until `target`, zero when it already passed.
pub(crate) fn std_duration_until(
    now: PrimitiveDateTime,
    target: PrimitiveDateTime,
) -> std::time::Duration {
    let delta = target - now;
    if delta.is_negative() {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::try_from(delta).unwrap_or(std::time::Duration::ZERO)
}
