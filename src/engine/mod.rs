pub mod dispatcher;
pub mod interpolate;
pub mod queue;
pub mod types;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use queue::JobQueue;
pub use worker::WorkerPool;
