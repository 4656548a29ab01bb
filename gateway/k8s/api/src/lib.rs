#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod ingress;

pub use self::{
    duration::K8sDuration,
    ingress::{IngressHTTP, IngressHTTPSpec, IngressHTTPStatus},
};
pub use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};
