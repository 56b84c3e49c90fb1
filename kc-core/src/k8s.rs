use std::collections::BTreeMap;

use crate::compose::Service;
use crate::config::Environment;
use crate::errors::*;
use crate::prelude::*;

err_impl! {KubernetesError,
    #[error("resource {0} appears to have been modified by an external process, aborting")]
    ModifiedExternally(String),
}

// The labels every resource we create carries: `app` for the service and the
// environment label for selector isolation between deployments sharing a
// namespace.
pub fn common_labels(env: &Environment, service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL_KEY.to_string(), service.name_escaped.clone()),
        (env.label.clone(), env.id.clone()),
    ])
}

pub fn label_selector(env: &Environment) -> String {
    format!("{}={}", env.label, env.id)
}

pub fn k8s_name(env: &Environment, service: &Service) -> String {
    if env.no_append {
        service.name_escaped.clone()
    } else {
        format!("{}-{}", service.name_escaped, env.id)
    }
}

// Sets the name, labels and annotations of a resource for the specified
// compose service.  User labels already present are kept.
pub fn init_object_meta(env: &Environment, service: &Service, meta: &mut metav1::ObjectMeta) {
    meta.name = Some(k8s_name(env, service));
    meta.labels.get_or_insert_with(BTreeMap::new).extend(common_labels(env, service));
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SERVICE_ANNOTATION_KEY.into(), service.name.clone());
}

/// The compose service name recorded on an owned resource, if any.
pub fn owned_service_name(meta: &metav1::ObjectMeta) -> Option<&str> {
    meta.annotations.as_ref()?.get(SERVICE_ANNOTATION_KEY).map(String::as_str)
}

// Verifies that a resource matched by our selector is actually the one we
// would have created for the named service.  Anything else means an external
// process has been meddling with the environment and the run must stop
// before mutating state it does not own.
pub fn verify_owned_resource(
    expected_service: &str,
    meta: &metav1::ObjectMeta,
) -> EmptyResult {
    if owned_service_name(meta) != Some(expected_service) {
        bail!(KubernetesError::modified_externally(meta.name.as_deref().unwrap_or("<unnamed>")));
    }
    Ok(())
}

/// Whether the target cluster looks like an OpenShift cluster, judged by the
/// presence of the *.openshift.io API groups.  The kube bearer token doubles
/// as the cluster registry password only on such clusters.
pub async fn is_openshift_shaped(client: &kube::Client) -> anyhow::Result<bool> {
    let groups = client.list_api_groups().await?;
    Ok(groups.groups.iter().any(|g| g.name.ends_with(".openshift.io")))
}
