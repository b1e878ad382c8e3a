//! Small shared helpers.

pub mod timestamps;

pub use timestamps::{elapsed_ms, iso_timestamp, now_utc, Timestamp};
