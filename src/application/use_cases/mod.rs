pub mod ingest;
pub mod lifecycle;
pub mod sweep;
