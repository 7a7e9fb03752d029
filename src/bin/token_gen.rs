//! Interactive Schwab authorization
//!
//! Walks through the authorization-code flow once and writes the credential
//! file the fetcher reads at start-up.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use price_history_fetcher::{
    auth::{
        unix_now, AuthorizationCodeProvider, ConsoleCodeProvider, Credential, CredentialStore,
        SchwabOAuth, TokenEndpoint,
    },
    Config,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Authorize API access and save the tokens", long_about = None)]
struct Args {
    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "token_gen=debug,price_history_fetcher=debug"
    } else {
        "token_gen=info,price_history_fetcher=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    info!("🔐 Schwab token generator");

    let config = Config::from_env()?;
    let store = CredentialStore::new(&config.schwab_token_path);
    let oauth = SchwabOAuth::new(&config)?;

    let code = ConsoleCodeProvider
        .obtain_code(&oauth.authorize_url())
        .await
        .context("no authorization code")?;
    let grant = oauth
        .exchange_code(&code)
        .await
        .context("authorization code exchange failed")?;

    let previous = store.load();
    let credential = Credential::from_grant(
        grant,
        previous.as_ref(),
        config.refresh.refresh_lifetime,
        unix_now(),
    )?;
    store.save(&credential)?;

    info!("✅ Tokens saved to {}", store.path().display());
    Ok(())
}
