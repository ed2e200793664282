//! Row key and partition key generation.
//!
//! Time-ordered keys are built on ticks: 100 ns intervals counted from
//! `0001-01-01T00:00:00Z`. Reversing a value against [`MAX_TICKS`] makes newer
//! timestamps sort lexicographically before older ones, which turns an
//! ascending table scan into a newest-first one.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::{NoContext, Timestamp, Uuid};

use crate::{Error, filter::Column, filter::Filter};

/// Ticks of `9999-12-31T23:59:59.9999999Z`.
pub const MAX_TICKS: u64 = 3_155_378_975_999_999_999;

/// Ticks of `1970-01-01T00:00:00Z`.
pub const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;

/// Unix milliseconds of `9999-12-31T23:59:59.999Z`.
pub const MAX_UNIX_MILLIS: u64 = 253_402_300_799_999;

pub const TICKS_PER_SECOND: u64 = 10_000_000;

pub const DEFAULT_ROUNDING_INTERVAL_MINUTES: i64 = 5;

/// Width of a rendered partition key; `MAX_TICKS` has 19 digits.
pub const PARTITION_KEY_WIDTH: usize = 19;

pub fn default_rounding_interval() -> TimeDelta {
    TimeDelta::minutes(DEFAULT_ROUNDING_INTERVAL_MINUTES)
}

/// A fresh UUIDv7, sortable by creation millisecond and monotonic within the process.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Largest millisecond value the 48-bit UUIDv7 time field holds.
const MAX_UUID_V7_MILLIS: u64 = (1 << 48) - 1;

/// A UUIDv7 whose time component is the reversed millisecond timestamp, so
/// ids for newer timestamps sort first.
///
/// Accepts timestamps from the late 11th century (where the reversal
/// overflows 48 bits) through the end of year 9999.
pub fn generate_time_ordered_id<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> Result<String, Error> {
    let utc = timestamp.with_timezone(&Utc);
    let reversed = i128::from(MAX_UNIX_MILLIS) - i128::from(utc.timestamp_millis());
    let reversed = u64::try_from(reversed)
        .ok()
        .filter(|r| *r <= MAX_UUID_V7_MILLIS)
        .ok_or_else(|| {
            Error::invalid(format!(
                "timestamp {utc} is outside the range of time-ordered ids"
            ))
        })?;

    let ts = Timestamp::from_unix(
        NoContext,
        reversed / 1000,
        ((reversed % 1000) * 1_000_000) as u32,
    );
    Ok(Uuid::new_v7(ts).to_string())
}

/// Converts a timestamp to ticks after normalising it to UTC.
pub fn to_ticks<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> Result<u64, Error> {
    let utc = timestamp.with_timezone(&Utc);
    let ticks = i128::from(utc.timestamp()) * i128::from(TICKS_PER_SECOND)
        + i128::from(utc.timestamp_subsec_nanos() / 100)
        + i128::from(UNIX_EPOCH_TICKS);
    u64::try_from(ticks)
        .ok()
        .filter(|t| *t <= MAX_TICKS)
        .ok_or_else(|| Error::invalid(format!("timestamp {utc} is outside the tick range")))
}

pub fn from_ticks(ticks: u64) -> Result<DateTime<Utc>, Error> {
    if ticks > MAX_TICKS {
        return Err(Error::invalid(format!("{ticks} exceeds the maximum tick value")));
    }
    let unix_ticks = i128::from(ticks) - i128::from(UNIX_EPOCH_TICKS);
    let secs = unix_ticks.div_euclid(i128::from(TICKS_PER_SECOND));
    let nanos = unix_ticks.rem_euclid(i128::from(TICKS_PER_SECOND)) * 100;
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, nanos as u32))
        .ok_or_else(|| Error::invalid(format!("{ticks} ticks is not a representable timestamp")))
}

pub fn reverse_ticks(ticks: u64) -> u64 {
    MAX_TICKS.saturating_sub(ticks)
}

/// Rounds to the nearest interval boundary; a value on the midpoint rounds up.
pub fn round_ticks(ticks: u64, interval_ticks: u64) -> Result<u64, Error> {
    if interval_ticks == 0 {
        return Err(Error::invalid("rounding interval must be positive"));
    }
    let interval = u128::from(interval_ticks);
    let rounded = (u128::from(ticks) + interval / 2 + 1) / interval * interval;
    u64::try_from(rounded)
        .ok()
        .filter(|r| *r <= MAX_TICKS)
        .ok_or_else(|| Error::invalid(format!("{ticks} ticks rounds past the maximum timestamp")))
}

fn interval_ticks(interval: TimeDelta) -> Result<u64, Error> {
    let ticks = i128::from(interval.num_seconds()) * i128::from(TICKS_PER_SECOND)
        + i128::from(interval.subsec_nanos() / 100);
    u64::try_from(ticks)
        .ok()
        .filter(|t| *t > 0)
        .ok_or_else(|| Error::invalid(format!("rounding interval {interval} must be positive")))
}

fn render_ticks(ticks: u64) -> String {
    format!("{:0width$}", ticks, width = PARTITION_KEY_WIDTH)
}

/// Partition key of the 5 minute bucket nearest to `timestamp`.
pub fn generate_partition_key<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> Result<String, Error> {
    generate_partition_key_with_interval(timestamp, default_rounding_interval())
}

pub fn generate_partition_key_with_interval<Tz: TimeZone>(
    timestamp: &DateTime<Tz>,
    interval: TimeDelta,
) -> Result<String, Error> {
    let interval = interval_ticks(interval)?;
    let rounded = round_ticks(to_ticks(timestamp)?, interval)?;
    Ok(render_ticks(reverse_ticks(rounded)))
}

/// Recovers the bucket timestamp a partition key was generated from.
pub fn decode_partition_key(partition_key: &str) -> Result<DateTime<Utc>, Error> {
    if partition_key.len() != PARTITION_KEY_WIDTH
        || !partition_key.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Error::invalid(format!(
            "{partition_key:?} is not a time bucketed partition key"
        )));
    }
    let reversed: u64 = partition_key
        .parse()
        .map_err(|_| Error::invalid(format!("{partition_key:?} overflows the tick range")))?;
    if reversed > MAX_TICKS {
        return Err(Error::invalid(format!(
            "{partition_key:?} overflows the tick range"
        )));
    }
    from_ticks(MAX_TICKS - reversed)
}

/// Structured predicate selecting the partitions whose bucket lies in
/// `[start, end)`.
///
/// Reversal flips comparison direction, so the bounds are the reversals of the
/// last tick before each boundary: `MAX - (end - 1)` inclusive and
/// `MAX - (start - 1)` exclusive.
pub fn partition_key_range<Tz: TimeZone>(
    start: &DateTime<Tz>,
    end: &DateTime<Tz>,
) -> Result<Filter, Error> {
    let start_ticks = to_ticks(start)?;
    let end_ticks = to_ticks(end)?;
    if start_ticks > end_ticks {
        return Err(Error::invalid(format!(
            "range start {} is after range end {}",
            start.with_timezone(&Utc),
            end.with_timezone(&Utc)
        )));
    }

    // MAX_TICKS + 1 still fits in u64, so neither bound can overflow.
    let lower = MAX_TICKS + 1 - end_ticks;
    let upper = MAX_TICKS + 1 - start_ticks;
    Ok(Column::partition_key()
        .ge(render_ticks(lower))
        .and(Column::partition_key().lt(render_ticks(upper))))
}

pub fn generate_partition_key_range_query<Tz: TimeZone>(
    start: &DateTime<Tz>,
    end: &DateTime<Tz>,
) -> Result<String, Error> {
    Ok(partition_key_range(start, end)?.to_filter_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn ticks_match_known_values() {
        assert_eq!(to_ticks(&utc("1970-01-01T00:00:00Z")).unwrap(), UNIX_EPOCH_TICKS);
        assert_eq!(
            to_ticks(&utc("9999-12-31T23:59:59.9999999Z")).unwrap(),
            MAX_TICKS
        );
        assert_eq!(to_ticks(&utc("0001-01-01T00:00:00Z")).unwrap(), 0);
        let t = utc("2024-03-01T12:34:56.789Z");
        assert_eq!(from_ticks(to_ticks(&t).unwrap()).unwrap(), t);
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        let before = DateTime::parse_from_rfc3339("0000-12-31T23:59:59Z").unwrap();
        assert!(matches!(to_ticks(&before), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            generate_time_ordered_id(&utc("1000-01-01T00:00:00Z")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn time_ordered_ids_cover_dates_before_the_unix_epoch() {
        let before = generate_time_ordered_id(&utc("1969-12-31T23:59:59.999Z")).unwrap();
        let epoch = generate_time_ordered_id(&utc("1970-01-01T00:00:00Z")).unwrap();
        let medieval = generate_time_ordered_id(&utc("1100-06-01T00:00:00Z")).unwrap();
        assert!(epoch < before);
        assert!(before < medieval);
        assert!(generate_time_ordered_id(&utc("9999-12-31T23:59:59.999Z")).is_ok());
    }

    #[test]
    fn midpoint_rounds_up() {
        let key = generate_partition_key(&utc("2024-01-01T10:02:30Z")).unwrap();
        let next = generate_partition_key(&utc("2024-01-01T10:05:00Z")).unwrap();
        assert_eq!(key, next);

        let below = generate_partition_key(&utc("2024-01-01T10:02:00Z")).unwrap();
        let start = generate_partition_key(&utc("2024-01-01T10:00:00Z")).unwrap();
        assert_eq!(below, start);
    }

    #[test]
    fn round_ticks_follows_the_integer_formula() {
        assert_eq!(round_ticks(0, 10).unwrap(), 0);
        assert_eq!(round_ticks(3, 10).unwrap(), 0);
        assert_eq!(round_ticks(5, 10).unwrap(), 10);
        assert_eq!(round_ticks(13, 10).unwrap(), 10);
        assert_eq!(round_ticks(15, 10).unwrap(), 20);
        assert!(round_ticks(MAX_TICKS, 10).is_err());
    }

    #[test]
    fn partition_keys_are_fixed_width_and_newest_first() {
        let older = generate_partition_key(&utc("2024-01-01T10:00:00Z")).unwrap();
        let newer = generate_partition_key(&utc("2024-01-01T10:05:00Z")).unwrap();
        assert_eq!(older.len(), PARTITION_KEY_WIDTH);
        assert_eq!(newer.len(), PARTITION_KEY_WIDTH);
        assert!(newer < older);
        assert_eq!(
            decode_partition_key(&newer).unwrap(),
            utc("2024-01-01T10:05:00Z")
        );
    }

    #[test]
    fn offsets_are_normalised_before_rounding() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
        assert_eq!(
            generate_partition_key(&local).unwrap(),
            generate_partition_key(&utc("2024-01-01T10:00:00Z")).unwrap()
        );
    }

    #[test]
    fn invalid_intervals_are_rejected() {
        let t = utc("2024-01-01T10:00:00Z");
        for interval in [TimeDelta::zero(), TimeDelta::minutes(-5), TimeDelta::nanoseconds(50)] {
            assert!(matches!(
                generate_partition_key_with_interval(&t, interval),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn time_ordered_ids_put_newer_first() {
        let older = generate_time_ordered_id(&utc("2024-01-01T10:00:00.000Z")).unwrap();
        let newer = generate_time_ordered_id(&utc("2024-01-01T10:00:00.001Z")).unwrap();
        assert!(newer < older);
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn range_query_shape() {
        let q = generate_partition_key_range_query(
            &utc("2024-01-01T10:00:00Z"),
            &utc("2024-01-01T11:00:00Z"),
        )
        .unwrap();
        assert!(q.starts_with("PartitionKey ge '"));
        assert!(q.contains("' and PartitionKey lt '"));

        assert!(matches!(
            partition_key_range(&utc("2024-01-02T00:00:00Z"), &utc("2024-01-01T00:00:00Z")),
            Err(Error::InvalidArgument(_))
        ));
    }
}
