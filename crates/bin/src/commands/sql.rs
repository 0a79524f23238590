//! SQL command - runs statements in a single session on one database.

use std::sync::Arc;

use lockbox::Schema;

use crate::cli::SqlArgs;
use crate::output::{OutputFormat, cell_text, cell_value, column_names, print_table};
use crate::storage::open_accounts;

/// Run the sql command
pub async fn run(args: &SqlArgs, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = open_accounts(&args.auth.storage).await?;
    let keyring = accounts.authenticate(&args.auth.token).await?;
    // Ad-hoc databases carry no tables of their own; the runner only stamps them.
    let schema = Arc::new(Schema::new(args.db.clone()));

    let mut results = Vec::with_capacity(args.statements.len());
    let outcome = async {
        let mut session = accounts
            .open_session(&keyring, args.service, &args.db, &schema)
            .await?;
        for statement in &args.statements {
            let rows = sqlx::query(statement).fetch_all(&mut *session).await?;
            tracing::debug!(statement, rows = rows.len(), "Statement finished");
            results.push(rows);
        }
        session.commit().await
    }
    .await;

    // Seal before reporting so a failed statement still leaves only ciphertext.
    accounts.shutdown().await?;
    outcome?;

    match format {
        OutputFormat::Human => {
            for (statement, rows) in args.statements.iter().zip(&results) {
                let Some(first) = rows.first() else {
                    println!("{statement}: ok");
                    continue;
                };
                let headers = column_names(first);
                let table: Vec<Vec<String>> = rows
                    .iter()
                    .map(|row| {
                        (0..headers.len())
                            .map(|i| cell_text(&cell_value(row, i)))
                            .collect()
                    })
                    .collect();
                let headers: Vec<&str> = headers.iter().map(String::as_str).collect();
                print_table(&headers, &table);
            }
        }
        OutputFormat::Json => {
            let sets: Vec<_> = results
                .iter()
                .map(|rows| {
                    rows.iter()
                        .map(|row| {
                            let columns = column_names(row);
                            let object: serde_json::Map<_, _> = columns
                                .into_iter()
                                .enumerate()
                                .map(|(i, name)| (name, cell_value(row, i)))
                                .collect();
                            serde_json::Value::Object(object)
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
            println!("{}", serde_json::to_string(&sets)?);
        }
    }

    Ok(())
}
