//! A peer-to-peer agent directory combining a Kademlia-style DHT with a
//! SWIM-style gossip membership layer.
//!
//! The DHT gives content-addressed lookup of agent records by key; gossip
//! gives eventually-consistent presence and capability information across
//! the cluster. [`facade::AgentMeshNode`] wires both into a single running
//! node from a [`config::Config`].

pub mod callbacks;
pub mod config;
pub mod dht;
pub mod error;
pub mod facade;
pub mod gossip;
pub mod logging;

pub use error::{Error, Result};
