pub mod export_job;
