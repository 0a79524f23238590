//! Building the account facade from command line arguments.

use lockbox::{Accounts, Deployment, EngineConfig, LockboxConfig};

use crate::cli::StorageArgs;

/// Open the data root described by `args`.
///
/// Self-hosted roots are created if missing; a hosted root must already exist.
pub async fn open_accounts(args: &StorageArgs) -> Result<Accounts, Box<dyn std::error::Error>> {
    let deployment = if args.hosted {
        if !args.data_dir.is_dir() {
            return Err(format!("Mount root {} does not exist", args.data_dir.display()).into());
        }
        Deployment::Hosted {
            mount_root: args.data_dir.clone(),
        }
    } else {
        tokio::fs::create_dir_all(&args.data_dir).await?;
        Deployment::SelfHosted {
            data_dir: args.data_dir.clone(),
        }
    };
    tracing::info!(root = %args.data_dir.display(), hosted = args.hosted, "Using data root");

    let engine = EngineConfig::default().with_idle_grace(args.idle_grace());
    let config = LockboxConfig::new(deployment, args.token_secret.as_bytes().to_vec()).with_engine(engine);
    Ok(Accounts::new(config))
}
