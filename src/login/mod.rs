//! Login orchestration: pending sessions, stage handling and token issuance.

mod orchestrator;
mod session;
mod token;

pub use orchestrator::{
    Authenticated, CredentialAccepted, FaceAccepted, FacePresentation, FaceSample, LoginConfig,
    LoginOrchestrator,
};
pub use session::{CodeStrike, LoginStage, PendingLogin, PendingLogins};
pub use token::{hash_token, IssuedToken, SessionTokenIssuer, TokenIssuer};
