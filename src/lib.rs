//! # Facegate (risk-adaptive facial login)
//!
//! `facegate` authenticates users in three stages: a credential (username or
//! DNI), a face sample checked against the registered templates, and a
//! manual fallback code. The face stage is the interesting one.
//!
//! ## Adaptive strictness
//!
//! Every identity carries a failure counter. The distance an embedding may
//! keep from the registered templates grows with that counter, up to a
//! ceiling, while the tolerance on head pose shrinks to a floor. Repeated
//! failures therefore trade some recognition slack for a stricter pose check.
//! All bounds live in a versioned [`policy::RecognitionPolicy`].
//!
//! ## Rate limiting
//!
//! Face attempts are counted per source address inside a sliding window.
//! Exceeding the limit writes one block entry for that source; later
//! attempts are refused with `429` until the entry expires or an operator
//! lifts it.
//!
//! ## Ledger
//!
//! Every attempt, accepted or not, is recorded with its stage, outcome,
//! failure reason and timing. The ledger is the source of both the rate
//! limit and the per-identity failure count.

pub mod api;
pub mod biometrics;
pub mod cli;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod ledger;
pub mod limiter;
pub mod login;
pub mod policy;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
