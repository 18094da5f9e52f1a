use std::path::PathBuf;

use ad_unmigration::unmigrate_ad_guid_users;
use ad_unmigration::unmigrate_ad_guid_users_once;
use ad_unmigration::MigrationOptions;
use anyhow::Context;
use clap::Parser;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ad-unmigration")]
#[command(about = "Moves Rancher users from GUID-based to DN-based Active Directory principals")]
struct Args {
    /// Only log the changes that would be made
    #[arg(long)]
    dry_run: bool,

    /// Delete users that no longer exist in Active Directory
    #[arg(long)]
    delete_missing_users: bool,

    /// Skip the migration if an earlier run has finished
    #[arg(long, conflicts_with_all = ["dry_run", "delete_missing_users"])]
    once: bool,

    /// Path to a kubeconfig file. Defaults to the in-cluster configuration or ~/.kube/config
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

async fn kube_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
        }
        None => Ok(Config::infer().await?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = kube_config(args.kubeconfig.as_ref()).await?;

    if args.once {
        info!("running migration unless it has finished before");
        unmigrate_ad_guid_users_once(config).await?;
    } else {
        let options = MigrationOptions {
            dry_run: args.dry_run,
            delete_missing_users: args.delete_missing_users,
        };
        unmigrate_ad_guid_users(config, options).await?;
    }

    Ok(())
}
