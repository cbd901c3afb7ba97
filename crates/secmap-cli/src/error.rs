use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] secmap_core::ValidationError),

    #[error(transparent)]
    Enrich(#[from] secmap_core::EnrichError),

    #[error(transparent)]
    Store(#[from] secmap_core::StoreError),

    #[error(transparent)]
    Warehouse(#[from] secmap_warehouse::WarehouseError),

    #[error(transparent)]
    Http(#[from] secmap_core::HttpError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Enrich(secmap_core::EnrichError::Validation(_)) => 2,
            Self::Enrich(_) | Self::Store(_) | Self::Warehouse(_) => 3,
            Self::Serialization(_) => 4,
            Self::Http(_) => 10,
        }
    }
}
