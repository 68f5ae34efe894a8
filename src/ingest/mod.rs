pub mod controller;
pub mod frame;
pub mod loop_worker;
pub mod reader;

pub use controller::{IngestLoop, IngestState, IngestSummary};
pub use frame::DecodedFrame;
pub use loop_worker::{ingest_until_exhausted, IngestStats};
pub use reader::StreamReader;
