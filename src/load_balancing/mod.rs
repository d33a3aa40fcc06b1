pub mod backend;
pub mod balancer;

pub use backend::{Backend, ConnectionLease, HealthState};
pub use balancer::{LoadBalancer, Selection};
