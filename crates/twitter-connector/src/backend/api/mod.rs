//! Official Twitter API v2 backend (OAuth 1.0a user context).

mod client;
mod media;
mod oauth;

pub use client::ApiAdapter;
pub use media::media_category;
pub use oauth::OAuthSigner;
