//! Info command - lists the user's databases and whether they are sealed.

use crate::cli::TokenArgs;
use crate::output::{OutputFormat, print_table};
use crate::storage::open_accounts;

/// Run the info command
pub async fn run(args: &TokenArgs, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = open_accounts(&args.storage).await?;
    let keyring = accounts.authenticate(&args.token).await?;
    let databases = accounts.databases(keyring.uid()).await?;

    let sealed = |path: &std::path::Path| {
        let mut ciphertext = path.as_os_str().to_owned();
        ciphertext.push(".enc");
        std::path::Path::new(&ciphertext).is_file()
    };

    match format {
        OutputFormat::Human => {
            println!("User:        {}", keyring.uid());
            if databases.is_empty() {
                println!("No databases found.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = databases
                .iter()
                .map(|db| {
                    vec![
                        db.service.to_string(),
                        db.name.clone(),
                        if sealed(&db.path) { "sealed" } else { "open" }.to_string(),
                    ]
                })
                .collect();
            print_table(&["SERVICE", "DATABASE", "STATE"], &rows);
        }
        OutputFormat::Json => {
            let entries: Vec<_> = databases
                .iter()
                .map(|db| {
                    serde_json::json!({
                        "service": db.service.as_str(),
                        "name": db.name,
                        "path": db.path.display().to_string(),
                        "sealed": sealed(&db.path),
                    })
                })
                .collect();
            let value = serde_json::json!({
                "uid": keyring.uid().as_str(),
                "databases": entries,
            });
            println!("{}", serde_json::to_string(&value)?);
        }
    }

    Ok(())
}
