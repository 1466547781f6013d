/// SDK version reported in assertion failures.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Panics with a Firestore-styled internal assertion message when the
/// condition is false. Only used for local invariants whose violation means
/// the cache would otherwise be corrupted.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally aborts with an internal assertion message.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Builds the message used for internal assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({SDK_VERSION}) INTERNAL ASSERTION FAILED: {}",
        message.as_ref()
    )
}
