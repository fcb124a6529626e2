//! Persisted data model: identities, contacts, messages, invites.

pub mod contact;
pub mod identity;
pub mod invite;
pub mod message;

pub use contact::{ChangeState, Contact, ContactDraft, TrustLevel, UpsertOutcome};
pub use identity::Identity;
pub use invite::Invite;
pub use message::{Direction, Message, MessageBlob, MessageStatus};
