use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum ChattyError {
    // Delivery errors
    ConnectionClosed,
    BackpressureExceeded,

    // Transport errors
    Transport(String),
    WriteTimeout,

    // Messages errors
    MessageParseError(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for ChattyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::BackpressureExceeded => write!(f, "Connection send buffer exceeded"),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::WriteTimeout => write!(f, "Write deadline exceeded"),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ChattyError {}

impl From<serde_json::Error> for ChattyError {
    fn from(err: serde_json::Error) -> Self {
        ChattyError::MessageParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChattyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_distinguishes_delivery_failures() {
        assert_eq!(ChattyError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            ChattyError::BackpressureExceeded.to_string(),
            "Connection send buffer exceeded"
        );
    }

    #[test]
    fn test_invalid_json_converts() {
        let err: ChattyError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ChattyError::MessageParseError(_)));
    }
}
