use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The listen address is held by another socket.
    #[error("Address in use: port {port}")]
    AddrInUse { port: u16 },

    /// Any other bind/listen failure.
    #[error("Bind error on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The serve loop failed after the socket was bound.
    #[error("Server error: {0}")]
    Serve(String),
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection string could not be used.
    #[error("Invalid connection string: {0}")]
    InvalidUrl(String),

    /// Connecting to or querying the datastore failed.
    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Per-connection channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Inbound frame could not be understood.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Writing to the transport failed.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("database.url".to_string());
        assert!(err.to_string().contains("Missing required field"));
        assert!(err.to_string().contains("database.url"));
    }

    #[test]
    fn addr_in_use_names_the_port() {
        let err = GatewayError::AddrInUse { port: 8080 };
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn channel_errors_carry_detail() {
        let err = ChannelError::Malformed("expected value at line 1".to_string());
        assert_eq!(err.to_string(), "Malformed frame: expected value at line 1");
    }
}
