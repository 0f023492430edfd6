//! Operations - pluggable handlers behind operation names
//!
//! The scheduler treats operations as opaque: it looks up the task's
//! operation name in the [`OperationDispatcher`] at execution time, so an
//! unknown name only fails when the task runs.

mod builtin;
mod dispatcher;
mod external;
mod handler;

pub use builtin::{
    Article, ArticleExtractor, ExtractArticlesOperation, OcrEngine, OcrOperation, PageSegmenter, Segment,
    SegmentOperation,
};
pub use dispatcher::{DispatchError, OperationDispatcher};
pub use external::{DEFAULT_COMMAND_TIMEOUT, ExternalCommand};
pub use handler::{FnHandler, OperationHandler};
