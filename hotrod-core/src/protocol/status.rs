//! Response status codes and their classification.

/// How a status affects the caller and the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    /// The operation ran; the body is operation-specific.
    Success,
    /// The server reported an error; the connection stays usable.
    Recoverable,
    /// The stream can no longer be trusted; the connection must be replaced.
    Fatal,
}

/// A known response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Success.
    NoError = 0x00,
    /// The conditional operation was not executed.
    NotPutRemovedReplaced = 0x01,
    /// The key does not exist.
    KeyDoesNotExist = 0x02,
    /// Success; the previous value follows.
    SuccessWithPrevious = 0x03,
    /// Not executed; the previous value follows.
    NotExecutedWithPrevious = 0x04,
    /// The iteration id is unknown to the server.
    InvalidIteration = 0x05,
    /// Success; the server stores objects.
    NoErrorObjectStorage = 0x06,
    /// Success with previous value; the server stores objects.
    SuccessWithPreviousObjectStorage = 0x07,
    /// Not executed with previous value; the server stores objects.
    NotExecutedWithPreviousObjectStorage = 0x08,
    /// Bad magic byte or message id.
    InvalidMagicOrMessageId = 0x81,
    /// Unknown command.
    UnknownCommand = 0x82,
    /// Unknown protocol version.
    UnknownVersion = 0x83,
    /// The request could not be parsed.
    RequestParsingError = 0x84,
    /// Generic server error.
    ServerError = 0x85,
    /// The command timed out on the server.
    CommandTimeout = 0x86,
    /// A cluster member was suspected.
    NodeSuspected = 0x87,
    /// The cache or server is not running.
    IllegalLifecycleState = 0x88,
}

impl Status {
    /// Every known status.
    pub const ALL: &'static [Status] = &[
        Status::NoError,
        Status::NotPutRemovedReplaced,
        Status::KeyDoesNotExist,
        Status::SuccessWithPrevious,
        Status::NotExecutedWithPrevious,
        Status::InvalidIteration,
        Status::NoErrorObjectStorage,
        Status::SuccessWithPreviousObjectStorage,
        Status::NotExecutedWithPreviousObjectStorage,
        Status::InvalidMagicOrMessageId,
        Status::UnknownCommand,
        Status::UnknownVersion,
        Status::RequestParsingError,
        Status::ServerError,
        Status::CommandTimeout,
        Status::NodeSuspected,
        Status::IllegalLifecycleState,
    ];

    /// Looks up a status byte, returning `None` for unknown values.
    pub fn from_code(code: u8) -> Option<Status> {
        Status::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Returns the raw status byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Classifies the status.
    pub fn category(self) -> StatusCategory {
        match self {
            Status::InvalidMagicOrMessageId
            | Status::UnknownCommand
            | Status::UnknownVersion
            | Status::RequestParsingError => StatusCategory::Fatal,
            Status::ServerError
            | Status::CommandTimeout
            | Status::NodeSuspected
            | Status::IllegalLifecycleState => StatusCategory::Recoverable,
            _ => StatusCategory::Success,
        }
    }

    /// Returns true for statuses that force the connection to be replaced.
    pub fn invalidates_connection(self) -> bool {
        self.category() == StatusCategory::Fatal
    }

    /// Returns true for every non-error status.
    pub fn is_success_family(self) -> bool {
        self.category() == StatusCategory::Success
    }

    /// Returns true if the operation executed.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::NoError
                | Status::SuccessWithPrevious
                | Status::NoErrorObjectStorage
                | Status::SuccessWithPreviousObjectStorage
        )
    }

    /// Returns true if a conditional operation was not executed.
    pub fn is_not_executed(self) -> bool {
        matches!(
            self,
            Status::NotPutRemovedReplaced
                | Status::NotExecutedWithPrevious
                | Status::NotExecutedWithPreviousObjectStorage
        )
    }

    /// Returns true if a previous value follows in the body.
    pub fn has_previous(self) -> bool {
        matches!(
            self,
            Status::SuccessWithPrevious
                | Status::NotExecutedWithPrevious
                | Status::SuccessWithPreviousObjectStorage
                | Status::NotExecutedWithPreviousObjectStorage
        )
    }

    /// Returns true if the server hinted that it stores objects.
    pub fn is_object_storage(self) -> bool {
        matches!(
            self,
            Status::NoErrorObjectStorage
                | Status::SuccessWithPreviousObjectStorage
                | Status::NotExecutedWithPreviousObjectStorage
        )
    }
}
