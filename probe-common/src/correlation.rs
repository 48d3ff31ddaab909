use uuid::Uuid;

/// Generate a per-dispatch correlation id. Pure: uniqueness is derived from
/// `uuid`'s cryptographic random source, not from any shared counter.
pub fn new_correlation_id() -> Uuid {
    Uuid::new_v4()
}
