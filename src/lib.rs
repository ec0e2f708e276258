pub mod common;
pub mod kernel;
pub mod measure;
pub mod pipeline;
pub mod pprint;
pub mod record;
pub mod schedule;
pub mod scheduler;
pub mod search;
pub mod target;
pub mod task;
pub mod utils;
pub mod verification;
pub mod workload;
