//! Twitter connector with two interchangeable backends.
//!
//! A host hands an [`ActionRequest`] to the [`Dispatcher`], which validates it,
//! picks a backend (the official API or a logged-in web session), retries where
//! that is safe, and returns a backend-independent [`ActionResult`] or a
//! [`ClassifiedError`].

pub mod action;
pub mod backend;
pub mod credentials;
pub mod dispatcher;
pub mod error;
mod ledger;
pub mod model;
pub mod normalize;
pub mod retry;
pub mod selector;
pub mod session_store;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{ActionKind, ActionPayload, ActionRequest, MediaRef, UserRef};
pub use backend::{BackendAdapter, BackendKind};
pub use credentials::{ConnectorEnv, CredentialKind, CredentialStore, Credentials};
pub use dispatcher::Dispatcher;
pub use error::{ClassifiedError, ConnectorResult, ErrorKind};
pub use model::ActionResult;
pub use selector::BackendSelector;
pub use session_store::SessionStore;
