pub mod consumer;
pub mod job_queue;
