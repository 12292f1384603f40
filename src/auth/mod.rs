// Authentication module
// Manages token lifecycle and credential persistence

mod credentials;
mod manager;
mod refresh;
mod types;

pub use credentials::{
    parse_credential, FileTokenStore, SqliteTokenStore, TokenStore, DEFAULT_TOKEN_KEY,
};
pub use manager::{AuthManager, DEFAULT_REFRESH_BUFFER_MINUTES};
pub use refresh::{refresh_token, DEFAULT_TOKEN_URL};
pub use types::{ClientCredentials, Credential, TokenData, TokenStatus};

#[cfg(any(test, feature = "test-utils"))]
pub use credentials::MemoryTokenStore;
