//! Repositories — one module per table, free functions over the [`Store`].
//!
//! Every function is individually transactional; the contact merge runs in
//! an explicit transaction so the TOFU/pending decision is atomic with
//! respect to concurrent readers.

pub mod contacts;
pub mod identities;
pub mod invites;
pub mod messages;
pub mod prefs;
