use crate::model::{ClassMethod, REPLY_SUCCESS};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Who started the shutdown of a connection or a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    /// The application called close or abort.
    Application,
    /// The library closed it because of an I/O or a protocol error.
    Library,
    /// The broker sent a close.
    Peer,
}

/// Why a connection or a channel was closed. It is set exactly once and then shared by every
/// observer as an `Arc<ShutdownReason>`.
#[derive(Clone)]
pub struct ShutdownReason {
    pub reply_code: u16,
    pub reply_text: String,
    pub initiator: Initiator,
    pub class_method: ClassMethod,
    pub cause: Option<Arc<dyn Error + Send + Sync>>,
}

impl ShutdownReason {
    pub fn application(reply_code: u16, reply_text: &str) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.to_string(),
            initiator: Initiator::Application,
            class_method: 0,
            cause: None,
        }
    }

    pub fn peer(reply_code: u16, reply_text: &str, class_method: ClassMethod) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.to_string(),
            initiator: Initiator::Peer,
            class_method,
            cause: None,
        }
    }

    pub fn library(reply_code: u16, reply_text: &str) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.to_string(),
            initiator: Initiator::Library,
            class_method: 0,
            cause: None,
        }
    }

    /// A library initiated shutdown caused by an error.
    pub fn library_error(reply_code: u16, err: anyhow::Error) -> Self {
        let reply_text = err.to_string();
        let cause: Box<dyn Error + Send + Sync> = err.into();

        Self {
            reply_code,
            reply_text,
            initiator: Initiator::Library,
            class_method: 0,
            cause: Some(Arc::from(cause)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reply_code == REPLY_SUCCESS
    }
}

impl fmt::Debug for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownReason")
            .field("reply_code", &self.reply_code)
            .field("reply_text", &self.reply_text)
            .field("initiator", &self.initiator)
            .field("class_method", &format!("{:08X}", self.class_method))
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} initiated shutdown, code={}, text={}",
            self.initiator, self.reply_code, self.reply_text
        )?;

        if let Some(cause) = &self.cause {
            write!(f, ", cause={cause}")?;
        }

        Ok(())
    }
}
