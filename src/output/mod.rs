pub mod formatters;
pub mod senders;

pub use formatters::{ConsoleFormatter, CsvFormatter, EventFormatter, JsonFormatter};
pub use senders::{ConsoleSink, EventSink, FileSink};
