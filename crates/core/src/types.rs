/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Entity versions increment in 0.1 steps on every mutation.
pub type EntityVersion = f64;
