//! Message routing between connections and the session layer.

pub mod router;

pub use router::{Reply, Router, RouterEvent};
