//! Task model, typed payloads and submission.

pub mod model;
pub mod payload;
pub mod producer;

pub use model::{DeliveryMessage, TaskRecord, TaskStatus, TaskType, TaskUpdate};
pub use producer::Producer;
