use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Relay returned HTTP {status}")]
    Relay { status: u16 },

    #[error("Decode context is suspended")]
    Suspended,

    #[error("One-shot node already started")]
    NodeSpent,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("AppError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

impl AppError {
    fn kind(&self) -> &str {
        match self {
            AppError::Http(_) => "http",
            AppError::Json(_) => "json",
            AppError::Audio(_) => "audio",
            AppError::Decode(_) => "decode",
            AppError::Relay { .. } => "relay",
            AppError::Suspended => "suspended",
            AppError::NodeSpent => "node_spent",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kind_and_message() {
        let value = serde_json::to_value(AppError::Relay { status: 502 }).unwrap();
        assert_eq!(value["kind"], "relay");
        assert_eq!(value["message"], "Relay returned HTTP 502");
    }
}
