use thiserror::Error;

/// Drive guard error types
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor already stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sensor failed: {0}")]
    SensorFailed(String),

    #[error("Traffic counter unavailable: {0}")]
    CounterUnavailable(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for monitor operations
pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MonitorError::InvalidConfig("cooldown_secs must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: cooldown_secs must be positive"
        );
        assert_eq!(MonitorError::Stopped.to_string(), "Monitor already stopped");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: MonitorError = parse.unwrap_err().into();
        assert!(matches!(err, MonitorError::Json(_)));
    }
}
