//! Core functionality: the link layer to the turnie peripheral.

pub mod link;

pub use link::{BluestTransport, LinkController, SessionSnapshot};
