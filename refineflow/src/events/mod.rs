//! Runner events and the sinks that receive them.

mod event;
mod sink;

pub use event::RunnerEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
