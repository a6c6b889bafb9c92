pub mod context;
pub mod engine;
pub mod evaluators;
pub mod notifier;
pub mod sink;
pub mod types;

pub use context::EvalContext;
pub use engine::DetectionEngine;
pub use notifier::Notifier;
pub use sink::ViolationSink;
