//! Recover command - sweeps tombstones and repairs the user's databases.

use crate::cli::TokenArgs;
use crate::output::{OutputFormat, print_table};
use crate::storage::open_accounts;

/// Run the recover command
pub async fn run(args: &TokenArgs, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = open_accounts(&args.storage).await?;
    let swept = accounts.sweep_tombstones().await?;
    let keyring = accounts.authenticate(&args.token).await?;
    let report = accounts.recover_user(&keyring).await?;

    match format {
        OutputFormat::Human => {
            println!("Tombstones removed: {swept}");
            let rows: Vec<Vec<String>> = report
                .iter()
                .map(|(db, recovery)| {
                    vec![
                        db.service.to_string(),
                        db.name.clone(),
                        format!("{recovery:?}"),
                    ]
                })
                .collect();
            print_table(&["SERVICE", "DATABASE", "RECOVERY"], &rows);
        }
        OutputFormat::Json => {
            let entries: Vec<_> = report
                .iter()
                .map(|(db, recovery)| {
                    serde_json::json!({
                        "service": db.service.as_str(),
                        "name": db.name,
                        "recovery": format!("{recovery:?}"),
                    })
                })
                .collect();
            let value = serde_json::json!({
                "tombstones_removed": swept,
                "databases": entries,
            });
            println!("{}", serde_json::to_string(&value)?);
        }
    }

    Ok(())
}
