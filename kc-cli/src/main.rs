mod up;

use clap::{
    crate_version,
    Parser,
    Subcommand,
};
use kc_core::logging;
use kc_core::prelude::*;
use tracing::*;

#[derive(Parser)]
#[command(
    name = "kube-compose",
    about = "environments on Kubernetes made easy",
    version,
    propagate_version = true
)]
struct KubeComposeRoot {
    #[command(subcommand)]
    subcommand: KubeComposeSubcommand,

    /// Specify an alternate compose file
    #[arg(short = 'f', long = "file", global = true, default_value = "docker-compose.yml")]
    file: String,

    /// Namespace for the environment; defaults to the namespace of the
    /// current kube config context
    #[arg(short = 'n', long, global = true, env = NAMESPACE_ENV_VAR)]
    namespace: Option<String>,

    /// Isolates environments deployed to a shared namespace, by suffixing
    /// pod and service names and isolating label selectors
    #[arg(short = 'e', long = "env-id", global = true, env = ENV_ID_ENV_VAR)]
    env_id: Option<String>,

    /// Do not append "-{env-id}" to the pod and service names, so DNS
    /// lookups work on the exact service names from the compose file
    #[arg(short = 'E', long = "env-id-no-append", global = true)]
    env_id_no_append: bool,

    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        env = LOG_LEVEL_ENV_VAR,
        default_value = logging::DEFAULT_LOG_LEVEL
    )]
    log_level: String,
}

#[derive(Subcommand)]
enum KubeComposeSubcommand {
    #[command(about = "create and start containers on Kubernetes in an order that respects depends_on")]
    Up(up::Args),

    #[command(about = "kube-compose version")]
    Version,
}

#[tokio::main]
async fn main() {
    let args = KubeComposeRoot::parse();
    if let Err(err) = logging::setup_for_cli(&args.log_level) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }

    let result = match &args.subcommand {
        KubeComposeSubcommand::Up(up_args) => up::cmd(&args, up_args).await,
        KubeComposeSubcommand::Version => {
            println!("kube-compose {}", crate_version!());
            Ok(())
        },
    };
    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}
