//! The DNS wire protocol: message structure, resource record types, and
//! (de)serialisation to and from the octet stream defined by RFC 1035.

pub mod deserialise;
pub mod serialise;
pub mod types;
