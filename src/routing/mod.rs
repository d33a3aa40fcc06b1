pub mod router;

pub use router::{HostMatcher, PathMatcher, RouteEntry, Router};
