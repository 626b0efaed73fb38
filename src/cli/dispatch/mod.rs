//! Command-line argument dispatch.
//!
//! Maps validated CLI arguments to the action that runs, currently only the
//! API server.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{
    ARG_ADMIN_TOKEN, ARG_CODE_PEPPER, ARG_DSN, ARG_EXTRACTOR_TIMEOUT, ARG_EXTRACTOR_URL, ARG_PORT,
    ARG_SESSION_TTL, ARG_TOKEN_TTL,
};
use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or malformed.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .map(|dsn| dsn.trim().to_string())
        .filter(|dsn| !dsn.is_empty());

    let extractor_url = matches
        .get_one::<String>(ARG_EXTRACTOR_URL)
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .map(|url| Url::parse(url).with_context(|| format!("invalid --extractor-url: {url}")))
        .transpose()?;

    let admin_token = matches
        .get_one::<String>(ARG_ADMIN_TOKEN)
        .map(|token| SecretString::from(token.trim().to_string()))
        .context("missing required argument: --admin-token")?;
    if admin_token.expose_secret().is_empty() {
        return Err(anyhow!("--admin-token must not be empty"));
    }

    let code_pepper = matches
        .get_one::<String>(ARG_CODE_PEPPER)
        .map(|pepper| SecretString::from(pepper.trim().to_string()))
        .context("missing required argument: --code-pepper")?;
    if code_pepper.expose_secret().is_empty() {
        return Err(anyhow!("--code-pepper must not be empty"));
    }

    Ok(Action::Server(Args {
        port,
        dsn,
        extractor_url,
        extractor_timeout_ms: matches
            .get_one::<u64>(ARG_EXTRACTOR_TIMEOUT)
            .copied()
            .unwrap_or(3000),
        session_ttl_seconds: matches
            .get_one::<u64>(ARG_SESSION_TTL)
            .copied()
            .unwrap_or(300),
        token_ttl_seconds: matches
            .get_one::<u64>(ARG_TOKEN_TTL)
            .copied()
            .unwrap_or(43_200),
        admin_token,
        code_pepper,
    }))
}
