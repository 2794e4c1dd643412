// Helper for generating UUIDv7 (timestamp-sortable UUIDs).
//
// PostgreSQL does not generate UUIDv7 natively, so ids for users and
// refresh tokens are minted app-side. Time ordering keeps the primary-key
// index append-mostly.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}
