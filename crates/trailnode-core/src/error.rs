use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Short error code string used in logs and fault reports.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Config(_) => "CONFIG_ERROR",
            NodeError::Database(_) => "DATABASE_ERROR",
            NodeError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_variant() {
        assert_eq!(NodeError::Config("bad".into()).code(), "CONFIG_ERROR");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(NodeError::from(io).code(), "IO_ERROR");
        let db = rusqlite::Error::InvalidQuery;
        assert_eq!(NodeError::from(db).code(), "DATABASE_ERROR");
    }
}
