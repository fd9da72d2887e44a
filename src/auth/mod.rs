// Bearer credential handling.
// Storage and expiry decoding of the credential, and the manager that keeps it fresh.

pub mod manager;
pub mod token;

pub use manager::{DEFAULT_CHECK_INTERVAL, TokenManager};
pub use token::{
    Credential, CredentialStore, DEFAULT_EXPIRY_BUFFER, TOKEN_KEY, decode_expiry, is_expiring,
};
