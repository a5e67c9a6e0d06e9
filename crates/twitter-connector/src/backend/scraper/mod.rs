//! Browser-session backend speaking the web client's private endpoints.

mod client;
mod pacer;
mod session;

pub use client::ScraperAdapter;
pub use pacer::Pacer;
pub use session::SessionRefresher;
