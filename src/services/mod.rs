pub mod active_response;
pub mod cursor_store;
pub mod detection;
pub mod engine;
pub mod event_stream;
pub mod features;
pub mod harvester;
pub mod mysql_source;
pub mod parquet_archive;
pub mod sink;

pub use active_response::{AdminClient, ResponseDirective, ResponseQueue};
pub use cursor_store::CursorStore;
pub use detection::{BatchOutcome, DetectionEngine, LogRecord};
pub use engine::DetectionService;
pub use event_stream::{EventStream, StreamConsumer, StreamMessage};
pub use features::{BehaviorTracker, FeatureExtractor};
pub use harvester::HybridHarvester;
pub use mysql_source::SourceClient;
pub use parquet_archive::ParquetArchive;
pub use sink::{AnomalySink, SinkReport};
