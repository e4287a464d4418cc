//! Unique id generation
//!
//! Every conversation and message gets one id from here. UUID v7 keeps ids
//! time-ordered, so ids created later always sort after ids created earlier.

use uuid::Uuid;

/// Generate a new unique, time-ordered id.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}
