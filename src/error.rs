use crate::bus::BusError;
use crate::ingest::IngestError;
use crate::preview::PreviewError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("preview: {0}")]
    Preview(#[from] PreviewError),

    #[error("ingest: {0}")]
    Ingest(#[from] IngestError),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
