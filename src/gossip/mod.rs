//! SWIM-style gossip membership and agent presence dissemination.

pub mod message;
pub mod peer;
pub mod presence;
pub mod protocol;
