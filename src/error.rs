/// Error taxonomy for the pool core.
///
/// Stratum-visible codes follow the de-facto standard table miners expect;
/// everything else is internal and mapped to code 20 at the wire.

use thiserror::Error;

/// Protocol-visible stratum error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StratumErrorCode {
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
    UnauthorizedWorker = 24,
    NotSubscribed = 25,
}

impl StratumErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Failures of a single share submission. Each maps to a stratum code and is
/// surfaced to the submitter, never retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ShareError {
    #[error("job not found")]
    JobNotFound,

    #[error("duplicate share")]
    DuplicateShare,

    #[error("low difficulty share ({0})")]
    LowDifficultyShare(f64),

    #[error("unauthorized worker")]
    UnauthorizedWorker,

    #[error("not subscribed")]
    NotSubscribed,

    #[error("{0}")]
    Other(String),
}

impl ShareError {
    pub fn stratum_code(&self) -> StratumErrorCode {
        match self {
            ShareError::JobNotFound => StratumErrorCode::JobNotFound,
            ShareError::DuplicateShare => StratumErrorCode::DuplicateShare,
            ShareError::LowDifficultyShare(_) => StratumErrorCode::LowDifficultyShare,
            ShareError::UnauthorizedWorker => StratumErrorCode::UnauthorizedWorker,
            ShareError::NotSubscribed => StratumErrorCode::NotSubscribed,
            ShareError::Other(_) => StratumErrorCode::Other,
        }
    }
}

/// Fatal startup failures. Any of these refuses the pool; periodic failures
/// after startup are logged and retried instead.
#[derive(Debug, Error)]
pub enum PoolStartupError {
    #[error("pool address '{0}' was rejected by the daemon")]
    InvalidPoolAddress(String),

    #[error("no pool configuration for detected network '{0}'")]
    UnsupportedNetwork(String),

    #[error("daemon error during startup: {0}")]
    Daemon(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stratum_codes_match_wire_table() {
        assert_eq!(StratumErrorCode::Other.code(), 20);
        assert_eq!(StratumErrorCode::JobNotFound.code(), 21);
        assert_eq!(StratumErrorCode::DuplicateShare.code(), 22);
        assert_eq!(StratumErrorCode::LowDifficultyShare.code(), 23);
        assert_eq!(StratumErrorCode::UnauthorizedWorker.code(), 24);
        assert_eq!(StratumErrorCode::NotSubscribed.code(), 25);
    }

    #[test]
    fn low_difficulty_message_renders_bare_number() {
        let e = ShareError::LowDifficultyShare(8.0);
        assert_eq!(e.to_string(), "low difficulty share (8)");

        let e = ShareError::LowDifficultyShare(0.5);
        assert_eq!(e.to_string(), "low difficulty share (0.5)");
    }

    #[test]
    fn share_errors_map_to_codes() {
        assert_eq!(
            ShareError::JobNotFound.stratum_code(),
            StratumErrorCode::JobNotFound
        );
        assert_eq!(
            ShareError::Other("junk".into()).stratum_code(),
            StratumErrorCode::Other
        );
    }
}
