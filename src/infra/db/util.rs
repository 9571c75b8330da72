use time::OffsetDateTime;

use crate::cache::error::StoreError;

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::corrupt("expected row is missing"),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::corrupt(format!("column {index}: {source}"))
        }
        sqlx::Error::Database(db)
            if db.message().contains("constraint failed")
                || db.message().contains("UNIQUE")
                || db.message().contains("CHECK") =>
        {
            StoreError::Integrity(db.message().to_string())
        }
        other => StoreError::backend(other),
    }
}

pub(crate) fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(millis: i64, column: &'static str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| StoreError::corrupt(format!("{column}: {err}")))
}

pub(crate) fn count(value: i64, table: &'static str) -> Result<u64, StoreError> {
    value
        .try_into()
        .map_err(|_| StoreError::corrupt(format!("negative row count for {table}")))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn millis_round_trip_drops_sub_millisecond_precision() {
        let at = datetime!(2024-03-01 12:30:15.123_456 UTC);
        let millis = to_millis(at);
        assert_eq!(millis % 1_000, 123);
        assert_eq!(
            from_millis(millis, "at").expect("valid"),
            datetime!(2024-03-01 12:30:15.123 UTC)
        );
    }

    #[test]
    fn out_of_range_millis_is_corrupt() {
        assert!(matches!(
            from_millis(i64::MAX, "at"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
