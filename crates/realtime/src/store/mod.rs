pub mod records;
pub mod tasks;

pub use records::RecordStore;
pub use tasks::TaskPipeline;
