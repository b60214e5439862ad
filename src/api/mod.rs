//! Operator HTTP API: health plus a read/cancel view over active transfers.

mod handlers;
pub mod response;
mod routes;

pub use routes::create_router;
