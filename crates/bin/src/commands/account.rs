//! Register and login commands - both print a bearer token.

use lockbox::IssuedToken;

use crate::cli::CredentialArgs;
use crate::output::OutputFormat;
use crate::storage::open_accounts;

/// Run the register command
pub async fn register(
    args: &CredentialArgs,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = open_accounts(&args.storage).await?;
    let issued = accounts.register(&args.email, &args.secret).await?;
    print_token(&issued, format)
}

/// Run the login command
pub async fn login(
    args: &CredentialArgs,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = open_accounts(&args.storage).await?;
    let issued = accounts.login(&args.email, &args.secret).await?;
    print_token(&issued, format)
}

fn print_token(issued: &IssuedToken, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Human => {
            println!("Token:       {}", issued.token);
            println!("Expires at:  {}", issued.expires_at);
        }
        OutputFormat::Json => {
            let value = serde_json::json!({
                "token": issued.token,
                "access_secret": issued.access_secret.to_string(),
                "expires_at": issued.expires_at,
            });
            println!("{}", serde_json::to_string(&value)?);
        }
    }
    Ok(())
}
