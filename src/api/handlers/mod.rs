mod admin;
mod jobs;

pub use admin::health;
pub use jobs::{cancel_job, get_job, list_jobs};
