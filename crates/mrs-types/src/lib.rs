//! The wire and persistence data model described by the registry's data
//! model specification: registrations, tombstones, users, keys, tokens, and
//! peers, plus the identity string format that threads through all of them.

mod change;
mod identity;
mod key;
mod peer;
mod registration;
mod token;
mod tombstone;
mod user;

pub use change::{ChangeEvent, ChangeKind};
pub use identity::{parse_identity, validate_identity, Identity, IdentityError, RESERVED_SERVER_IDENTITY};
pub use key::{Key, KeyAlgorithm};
pub use peer::Peer;
pub use registration::{generate_registration_id, CanonicalId, Registration, REGISTRATION_ID_PREFIX};
pub use token::Token;
pub use tombstone::Tombstone;
pub use user::User;

pub use mrs_geometry::{BoundingBox, Coordinate, Geometry};

/// UTC timestamp at millisecond precision, as required by the data model.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Protocol version advertised at `/.well-known/mrs`.
pub const MRS_VERSION: &str = "1.0";
