//! Offline edge for the Amanakshar poetry site.
//!
//! [`offline`] hosts the cache controller, [`fetch`] the resilient API
//! client and its request state machines, [`preload`] the prioritised asset
//! preloader. All three reach the network through [`net::Network`].

pub mod application;
pub mod config;
pub mod fetch;
pub mod infra;
pub mod net;
pub mod offline;
pub mod preload;

pub(crate) mod util;
