#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("no {category} record found for {query}")]
    NotFound {
        category: &'static str,
        query: String,
    },
    #[error("duplicate {category} record '{id}'")]
    Duplicate { category: &'static str, id: String },
    #[error("could not (de)serialize record: {0}")]
    Encode(#[from] serde_json::Error),
    #[cfg(feature = "askar")]
    #[error("storage backend error: {0}")]
    Backend(#[from] aries_askar::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}
