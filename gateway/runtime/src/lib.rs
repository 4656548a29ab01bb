#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_cache as cache;
pub use gateway_core as core;
pub use gateway_http as http;
pub use gateway_k8s_api as k8s;
pub use gateway_k8s_index as index;

mod args;
pub mod health;
pub mod leader;
pub mod lease;


pub use self::{
    args::Args,
    health::HealthChecker,
    leader::{ElectionConfig, Elector, LeaderCallbacks},
};
