use serde::{Deserialize, Serialize};

/// Result alias used across the workspace. Operations return a typed value
/// or one kind from the taxonomy below.
pub type FkResult<T> = Result<T, ErrorKind>;

/// Every operation in the system resolves to one of these kinds. The kinds
/// travel over the wire as the numeric code in the response envelope, so
/// the `i32` mapping is part of the protocol and must stay stable.
#[derive(
    thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("SUCCESS")]
    Success,

    // parameter / header
    #[error("Error: parameter missing or invalid")]
    ParameterMissingOrInvalid,
    #[error("Error: unrecognized header")]
    UnrecognizedHeader,
    #[error("Error: unsupported http method")]
    UnsupportedHttpMethod,

    // existence
    #[error("Error: factor already exists")]
    FactorAlreadyExists,
    #[error("Error: factor not exists")]
    FactorNotExists,
    #[error("Error: factor version already exists")]
    FactorVersionAlreadyExists,
    #[error("Error: factor version not exists")]
    FactorVersionNotExists,
    #[error("Error: linkage already exists")]
    LinkageAlreadyExists,
    #[error("Error: linkage not exists")]
    LinkageNotExists,
    #[error("Error: tick stock not exists")]
    TickStockNotExists,
    #[error("Error: tick stock view not exists")]
    TickStockViewNotExists,
    #[error("Error: tick data not exists")]
    TickDataNotExists,
    #[error("Error: tick data not available")]
    TickDataNotAvailable,
    #[error("Error: factor result not exists")]
    FactorResultNotExists,
    #[error("Error: group factor not exists")]
    GroupFactorNotExists,
    #[error("Error: task already exists")]
    TaskAlreadyExists,
    #[error("Error: task not exists")]
    TaskNotExists,
    #[error("Error: task handler not exists")]
    TaskHandlerNotExists,
    #[error("Error: task group not exists")]
    TaskGroupNotExists,
    #[error("Error: task group is empty")]
    TaskGroupIsEmpty,

    // semantic
    #[error("Error: group factor signature not matched")]
    GroupFactorSignatureNotMatched,
    #[error("Error: sub factor conflict with other factor")]
    SubFactorConflictWithOtherFactor,
    #[error("Error: group factor source conflict")]
    GroupFactorSourceConflict,
    #[error("Error: invalid stock view name")]
    InvalidStockViewName,
    #[error("Error: invalid stock view relation")]
    InvalidStockViewRelation,
    #[error("Error: invalid factor result")]
    InvalidFactorResult,
    #[error("Error: tick result incorrect")]
    TickResultIncorrect,

    // runtime
    #[error("Error: db execution failed")]
    DbExecutionFailed,
    #[error("Error: http connection failed")]
    HttpConnectionFailed,
    #[error("Error: server internal error")]
    ServerInternalError,
    #[error("Error: factor generate failed")]
    FactorGenerateFailed,
    #[error("Error: failed to load factor generator module")]
    FailedToLoadFactorGeneratorModule,
    #[error("Error: failed to callback master")]
    FailedToCallbackMaster,
    #[error("Error: failed to send task command")]
    FailedToSendTaskCommand,

    // scheduling
    #[error("Error: no worker to be assigned")]
    NoWorkerToBeAssigned,
    #[error("Error: task has nothing to be done")]
    TaskHasNothingToBeDone,
    #[error("Error: worker version deprecated")]
    WorkerVersionDeprecated,
    #[error("Error: worker not exists")]
    WorkerNotExists,
    #[error("Error: cannot connect to namenode")]
    CannotConnectToNamenode,
}

impl From<ErrorKind> for i32 {
    fn from(kind: ErrorKind) -> i32 {
        match kind {
            ErrorKind::Success => 0,

            ErrorKind::ParameterMissingOrInvalid => 101,
            ErrorKind::UnrecognizedHeader => 102,
            ErrorKind::UnsupportedHttpMethod => 103,

            ErrorKind::FactorAlreadyExists => 201,
            ErrorKind::FactorNotExists => 202,
            ErrorKind::FactorVersionAlreadyExists => 203,
            ErrorKind::FactorVersionNotExists => 204,
            ErrorKind::LinkageAlreadyExists => 205,
            ErrorKind::LinkageNotExists => 206,
            ErrorKind::TickStockNotExists => 207,
            ErrorKind::TickStockViewNotExists => 208,
            ErrorKind::TickDataNotExists => 209,
            ErrorKind::TickDataNotAvailable => 210,
            ErrorKind::FactorResultNotExists => 211,
            ErrorKind::GroupFactorNotExists => 212,
            ErrorKind::TaskAlreadyExists => 213,
            ErrorKind::TaskNotExists => 214,
            ErrorKind::TaskHandlerNotExists => 215,
            ErrorKind::TaskGroupNotExists => 216,
            ErrorKind::TaskGroupIsEmpty => 217,

            ErrorKind::GroupFactorSignatureNotMatched => 301,
            ErrorKind::SubFactorConflictWithOtherFactor => 302,
            ErrorKind::GroupFactorSourceConflict => 303,
            ErrorKind::InvalidStockViewName => 304,
            ErrorKind::InvalidStockViewRelation => 305,
            ErrorKind::InvalidFactorResult => 306,
            ErrorKind::TickResultIncorrect => 307,

            ErrorKind::DbExecutionFailed => 401,
            ErrorKind::HttpConnectionFailed => 402,
            ErrorKind::ServerInternalError => 403,
            ErrorKind::FactorGenerateFailed => 404,
            ErrorKind::FailedToLoadFactorGeneratorModule => 405,
            ErrorKind::FailedToCallbackMaster => 406,
            ErrorKind::FailedToSendTaskCommand => 407,

            ErrorKind::NoWorkerToBeAssigned => 501,
            ErrorKind::TaskHasNothingToBeDone => 502,
            ErrorKind::WorkerVersionDeprecated => 503,
            ErrorKind::WorkerNotExists => 504,
            ErrorKind::CannotConnectToNamenode => 505,
        }
    }
}

impl From<i32> for ErrorKind {
    fn from(value: i32) -> ErrorKind {
        match value {
            0 => ErrorKind::Success,

            101 => ErrorKind::ParameterMissingOrInvalid,
            102 => ErrorKind::UnrecognizedHeader,
            103 => ErrorKind::UnsupportedHttpMethod,

            201 => ErrorKind::FactorAlreadyExists,
            202 => ErrorKind::FactorNotExists,
            203 => ErrorKind::FactorVersionAlreadyExists,
            204 => ErrorKind::FactorVersionNotExists,
            205 => ErrorKind::LinkageAlreadyExists,
            206 => ErrorKind::LinkageNotExists,
            207 => ErrorKind::TickStockNotExists,
            208 => ErrorKind::TickStockViewNotExists,
            209 => ErrorKind::TickDataNotExists,
            210 => ErrorKind::TickDataNotAvailable,
            211 => ErrorKind::FactorResultNotExists,
            212 => ErrorKind::GroupFactorNotExists,
            213 => ErrorKind::TaskAlreadyExists,
            214 => ErrorKind::TaskNotExists,
            215 => ErrorKind::TaskHandlerNotExists,
            216 => ErrorKind::TaskGroupNotExists,
            217 => ErrorKind::TaskGroupIsEmpty,

            301 => ErrorKind::GroupFactorSignatureNotMatched,
            302 => ErrorKind::SubFactorConflictWithOtherFactor,
            303 => ErrorKind::GroupFactorSourceConflict,
            304 => ErrorKind::InvalidStockViewName,
            305 => ErrorKind::InvalidStockViewRelation,
            306 => ErrorKind::InvalidFactorResult,
            307 => ErrorKind::TickResultIncorrect,

            401 => ErrorKind::DbExecutionFailed,
            402 => ErrorKind::HttpConnectionFailed,
            403 => ErrorKind::ServerInternalError,
            404 => ErrorKind::FactorGenerateFailed,
            405 => ErrorKind::FailedToLoadFactorGeneratorModule,
            406 => ErrorKind::FailedToCallbackMaster,
            407 => ErrorKind::FailedToSendTaskCommand,

            501 => ErrorKind::NoWorkerToBeAssigned,
            502 => ErrorKind::TaskHasNothingToBeDone,
            503 => ErrorKind::WorkerVersionDeprecated,
            504 => ErrorKind::WorkerNotExists,
            505 => ErrorKind::CannotConnectToNamenode,

            _ => ErrorKind::ServerInternalError,
        }
    }
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self.into()
    }

    /// A zero-work outcome: the task succeeded without scheduling anything.
    pub fn is_benign(self) -> bool {
        matches!(self, ErrorKind::TaskHasNothingToBeDone)
    }

    /// The task could not be placed right now and should be queued.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NoWorkerToBeAssigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let kinds = [
            ErrorKind::Success,
            ErrorKind::ParameterMissingOrInvalid,
            ErrorKind::FactorAlreadyExists,
            ErrorKind::LinkageNotExists,
            ErrorKind::TaskAlreadyExists,
            ErrorKind::GroupFactorSignatureNotMatched,
            ErrorKind::DbExecutionFailed,
            ErrorKind::NoWorkerToBeAssigned,
            ErrorKind::TaskHasNothingToBeDone,
            ErrorKind::CannotConnectToNamenode,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from(kind.code()), kind);
        }
    }

    #[test]
    fn test_unknown_code_collapses_to_internal_error() {
        assert_eq!(ErrorKind::from(-77), ErrorKind::ServerInternalError);
        assert_eq!(ErrorKind::from(99999), ErrorKind::ServerInternalError);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ErrorKind::Success.to_string(), "SUCCESS");
        assert_eq!(
            ErrorKind::FactorAlreadyExists.to_string(),
            "Error: factor already exists"
        );
        assert_eq!(
            ErrorKind::NoWorkerToBeAssigned.to_string(),
            "Error: no worker to be assigned"
        );
    }

    #[test]
    fn test_benign_and_retryable_are_disjoint() {
        assert!(ErrorKind::TaskHasNothingToBeDone.is_benign());
        assert!(!ErrorKind::TaskHasNothingToBeDone.is_retryable());
        assert!(ErrorKind::NoWorkerToBeAssigned.is_retryable());
        assert!(!ErrorKind::NoWorkerToBeAssigned.is_benign());
    }
}
