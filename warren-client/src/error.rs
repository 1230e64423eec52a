use crate::model;
use std::fmt;

/// The category of a client failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytes arrived from the broker, the connection is torn down.
    ProtocolDecode,
    /// Reading from or writing to the socket failed.
    Transport,
    /// The channel or connection is closing or already closed.
    ClosedState,
    /// A consumer callback failed. It is contained and only reported through events.
    CallbackException,
    /// The broker didn't answer a close in time.
    CloseTimeout,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The reply of a synchronous method didn't arrive in time.
    Rpc,
    /// Every channel number up to the negotiated channel max is in use.
    ChannelLimit,
    /// An argument cannot be sent, like a name longer than 255 bytes.
    InvalidArgument,
}

/// Represents a connection or channel error. If `channel` is `None` it is a
/// connection error.
#[derive(Clone, Debug)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub channel: Option<model::ChannelNumber>,
    pub code: u16,
    pub message: String,
    pub class_method: model::ClassMethod,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("class_method", &format!("{:08X}", &self.class_method))
            .finish()
    }
}

impl std::error::Error for ClientError {}

/// Get the client error behind an `anyhow::Error` if there is any.
pub fn client_error(err: &anyhow::Error) -> Option<&ClientError> {
    err.downcast_ref::<ClientError>()
}

/// Get the kind of the error, errors not created by the library don't have one.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    client_error(err).map(|e| e.kind)
}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($kind:expr, $channel:expr, $code:expr, $message:expr, $cm:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::error::ClientError {
            kind: $kind,
            channel: $channel,
            code: $code,
            message: ::std::string::String::from($message),
            class_method: $cm,
        }))
    };
}
