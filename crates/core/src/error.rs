use thiserror::Error;

use crate::model::ScanLocation;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("operation cancelled by caller")]
    Cancelled,
    #[error("no base folders could be resolved for {location} under {root}")]
    NoBaseFolders { location: ScanLocation, root: String },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl SweepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SweepError::Cancelled)
    }
}
