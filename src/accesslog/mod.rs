pub mod gateway;
pub mod types;

pub use gateway::{AccessLogGateway, ScanSource};
pub use types::ScanEvent;
