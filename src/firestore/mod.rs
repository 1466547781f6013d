pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use api::{DocumentChange, DocumentSnapshot, QuerySnapshot, SetOptions, SnapshotMetadata};
pub use self::core::{
    FirestoreClient, FirestoreSettings, ListenOptions, ListenSource, ListenerRegistration,
    OnlineState, Query, QuerySnapshotStream,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::DatabaseId;
pub use value::FirestoreValue;

/// Verbosity of the crate's log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Error,
    Silent,
}

impl LogLevel {
    fn as_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Silent => log::LevelFilter::Off,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = FirestoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "error" => Ok(LogLevel::Error),
            "silent" => Ok(LogLevel::Silent),
            other => Err(error::invalid_argument(format!(
                "Invalid log level '{other}', expected debug, error or silent"
            ))),
        }
    }
}

/// Sets the maximum level passed to the installed `log` backend.
pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.as_filter());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("silent".parse::<LogLevel>().unwrap(), LogLevel::Silent);
        let err = "verbose".parse::<LogLevel>().unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn silent_turns_logging_off() {
        assert_eq!(LogLevel::Silent.as_filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Error.as_filter(), log::LevelFilter::Error);
    }
}
