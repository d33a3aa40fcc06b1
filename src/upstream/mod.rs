pub mod manager;

pub use manager::{Pool, UpstreamManager};
