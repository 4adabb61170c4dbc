//! Topic validation
//!
//! Broker-side matching (including wildcards) is trusted as-is, so the relay
//! only checks that names and filters are well formed before storing or
//! forwarding them.

pub mod validation;

pub use validation::{
    validate_description, validate_topic_filter, validate_topic_name, MAX_DESCRIPTION_CHARS,
    MAX_TOPIC_CHARS,
};
