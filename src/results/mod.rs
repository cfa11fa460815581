//! Output side: reading, classifying and dispatching process results.
//!
//! Data flow inside the reader task:
//!
//! ```text
//! process stdout -> ResultsDecoder -> classify -> ResultsPersister
//!                                             \-> AlertRegistry (buckets)
//!                                             \-> FlushAcknowledgements
//! ```

pub mod alert;
pub mod codec;
pub mod flush;
pub mod model;
pub mod parser;
pub mod persister;
pub mod reader;

pub use alert::{AlertObserver, AlertRegistry, AlertTrigger, AlertType, ObserverId};
pub use codec::{OutputFrame, ResultsDecoder};
pub use flush::{AckOutcome, FlushAcknowledgements};
pub use model::{
    AnomalyCause, AnomalyRecord, AutodetectResult, Bucket, BucketInfluencer, CategoryDefinition,
    FlushAcknowledgement, Influencer, ModelDebugOutput, ModelSizeStats, ModelSnapshot, Quantiles,
};
pub use parser::classify;
pub use persister::{JsonLinesPersister, MemoryPersister, NoopPersister, ResultsPersister};
pub use reader::{ReaderStats, ResultsReader};
