use time::OffsetDateTime;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as u64
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp() as u64
}
