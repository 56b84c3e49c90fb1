use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bollard::Docker;
use kc_core::compose::ComposeFile;
use kc_core::config::Environment;
use kc_core::errors::*;
use kc_core::fs::OsFilesystem;
use kc_core::k8s::is_openshift_shaped;
use kc_core::prelude::*;
use kc_up::progress::TracingReporter;
use secrecy::ExposeSecret;
use tracing::*;

use crate::KubeComposeRoot;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Detached mode: leave the services running in the background
    #[arg(short = 'd', long)]
    detach: bool,

    /// The docker registry user to authenticate as; the default is common
    /// for OpenShift clusters
    #[arg(long, env = REGISTRY_USER_ENV_VAR, default_value = DEFAULT_REGISTRY_USER)]
    registry_user: String,

    /// The docker registry password to authenticate with; when unset, the
    /// bearer token from the kube config is used, as is common for
    /// OpenShift clusters
    #[arg(long, env = REGISTRY_PASS_ENV_VAR, default_value = "")]
    registry_pass: String,

    /// Set runAsUser/runAsGroup for each pod based on the user of the
    /// pod's image and the "user" key of the pod's compose service
    #[arg(long)]
    run_as_user: bool,

    /// Skip adding all sibling ClusterIPs to pod host aliases (useful when
    /// in-cluster name resolution is sufficient)
    #[arg(short = 'a', long)]
    skip_host_aliases: bool,

    /// Skip pushing images to the registry: assumes they were previously
    /// pushed
    #[arg(short = 'p', long)]
    skip_push: bool,

    /// Pod history log lines to show when starting to tail logs
    #[arg(short = 't', long, default_value_t = DEFAULT_TAIL_LINES)]
    tail_lines: i64,
}

pub async fn cmd(root: &KubeComposeRoot, args: &Args) -> EmptyResult {
    let compose = ComposeFile::load(Path::new(&root.file))?;

    let kube_config = kube::Config::infer().await.context("could not load the kube config")?;
    let namespace =
        root.namespace.clone().unwrap_or_else(|| kube_config.default_namespace.clone());
    let env_id = root.env_id.clone().ok_or_else(|| {
        anyhow!("an environment id is required (--env-id or {ENV_ID_ENV_VAR})")
    })?;
    let env = Environment::new(&env_id, &namespace, root.env_id_no_append)?;

    let client = kube::Client::try_from(kube_config.clone())?;

    let mut registry_pass = args.registry_pass.clone();
    if registry_pass.is_empty() {
        if let Some(token) = kube_config.auth_info.token.as_ref() {
            match is_openshift_shaped(&client).await {
                Ok(true) => registry_pass = token.expose_secret().clone(),
                Ok(false) => {},
                Err(err) => warn!("could not probe the cluster for OpenShift API groups: {err}"),
            }
        }
    }
    let docker = Docker::connect_with_local_defaults()
        .context("could not connect to the docker daemon")?;

    let opts = kc_up::Options {
        detach: args.detach,
        skip_push: args.skip_push,
        skip_host_aliases: args.skip_host_aliases,
        run_as_user: args.run_as_user,
        tail_lines: args.tail_lines,
        registry_user: args.registry_user.clone(),
        registry_pass,
    };
    kc_up::run(
        compose,
        env,
        opts,
        docker,
        client,
        Arc::new(OsFilesystem),
        Box::new(TracingReporter),
    )
    .await
}
