//! Error types for the relaybot core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering assembly, channel, downstream pipeline, and configuration domains.
//! None of these ever reach the transport loop from the dispatch path; the
//! dispatcher converts them into user-facing text.

/// Top-level error type for the relaybot core library.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the per-user assembly engine.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("Assembler for user {user} is already closed")]
    Closed { user: String },

    #[error("Assembly engine has been shut down")]
    ShutDown,
}

/// Errors from chat transport channels.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed for channel {name}")]
    AuthFailed { name: String },

    #[error("Channel {name} failed to send: {message}")]
    SendFailed { name: String, message: String },

    #[error("Channel {name} connection failed: {message}")]
    ConnectionFailed { name: String, message: String },

    #[error("Channel {name} is not connected")]
    NotConnected { name: String },
}

/// Errors from the downstream conversational API.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP request failed: {message}")]
    Http { message: String },

    #[error("API returned code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Response parse error: {message}")]
    Parse { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Request failed: {message}")]
    Failed { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;
