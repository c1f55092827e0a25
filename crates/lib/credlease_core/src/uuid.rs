// Lease holder identifiers.
//
// Each refresh attempt gets its own holder id so that a release issued by a
// timed-out attempt can never clear a lease granted to a later attempt from
// the same process. UUIDv7 keeps ids time-sortable in logs.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Build a holder id of the form `<instance>:<uuidv7>`.
pub fn holder_id(instance: &str) -> String {
    format!("{instance}:{}", uuidv7())
}
