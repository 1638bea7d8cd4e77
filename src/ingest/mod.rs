pub mod cursor;
pub mod ingestor;

pub use ingestor::{IngestOutcome, Ingestor};
