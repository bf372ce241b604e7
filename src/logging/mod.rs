pub mod buffer;
pub mod entry;
pub mod sink;
pub mod stream;
pub mod streamer;
mod writer;

pub use buffer::LogBuffer;
pub use entry::{HistoryQuery, LogEntry, LogFilter, LogLevel, STREAM_SOURCE};
pub use sink::{LogSink, NullSink, ScopedLogger, TracingSink};
pub use stream::LogStream;
pub use streamer::{LogCallback, LogStats, LogStreamer};
