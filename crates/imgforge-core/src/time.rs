/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Milliseconds elapsed between two ISO 8601 timestamps produced by [`utc_now`].
///
/// Returns `None` if either timestamp fails to parse (should not happen for
/// timestamps this crate produced itself).
pub fn duration_ms_between(start: &str, end: &str) -> Option<u64> {
    let start = chrono::NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%M:%SZ").ok()?;
    let end = chrono::NaiveDateTime::parse_from_str(end, "%Y-%m-%dT%H:%M:%SZ").ok()?;
    let delta = end.signed_duration_since(start);
    u64::try_from(delta.num_milliseconds()).ok()
}
