pub mod fingerprint;
pub mod issuer;
pub mod refresh;

pub use fingerprint::fingerprint;
pub use issuer::{HttpTokenIssuer, IssuedToken, IssuerError, RefreshRequest, TokenIssuer};
pub use refresh::{
    CycleReport, Eligibility, RefreshError, RefreshExecutor, RefreshOutcome, RefreshPolicy,
};
