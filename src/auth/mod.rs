pub mod gotrue;
pub mod provider;
pub mod token;

pub use gotrue::GoTrueProvider;
pub use provider::{AuthProvider, ProviderSession, ProviderUser, SignUpData};
pub use token::{StoredToken, TokenService};
