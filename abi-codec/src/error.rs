#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("read past end of buffer: {needed} bytes needed at offset {offset}")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("invalid value for {type_name}: {reason}")]
    InvalidValue { type_name: String, reason: String },
    #[error("variant index {index} out of range for {variant}")]
    VariantIndex { variant: String, index: u32 },
    #[error("type nesting too deep while processing {0}")]
    DepthExceeded(String),
    #[error("invalid abi: {0}")]
    InvalidAbi(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AbiError {
    pub(crate) fn invalid(type_name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            type_name: type_name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AbiError>;
