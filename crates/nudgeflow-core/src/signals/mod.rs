//! Signal classification and window aggregation.
//!
//! Domain events are classified into signals with a priority and a window
//! type, then buffered per user until the window closes or a run is forced.

pub mod classifier;
pub mod window;

pub use classifier::{
    Classification, ClassificationTable, SignalClass, SignalClassifier, SignalPriority, WindowType,
    DEFAULT_CLASSIFICATIONS,
};
pub use window::{DueUser, IngestOutcome, SignalEntry, WindowAggregator};
