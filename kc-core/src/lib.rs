pub mod compose;
pub mod config;
pub mod constants;
pub mod docker;
pub mod errors;
pub mod fs;
pub mod k8s;
pub mod logging;
pub mod names;

pub mod prelude {
    pub use k8s_openapi::api::core::v1 as corev1;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
    pub use kube::ResourceExt;

    pub use crate::constants::*;
    pub use crate::errors::EmptyResult;
}

#[cfg(test)]
mod tests;
