//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations per table,
//! scoped by organization or connection.

pub mod connection;
pub mod oauth_state;
pub mod organization;
pub mod workspace;

pub use connection::{ConnectionPatch, ConnectionRepository, NewConnection};
pub use oauth_state::OAuthStateRepository;
pub use organization::OrganizationRepository;
pub use workspace::WorkspaceRepository;
