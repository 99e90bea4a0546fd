//! Inter-process communication: portals, services, sessions and rings.

mod connection;
mod ring;
mod service;

pub(crate) mod portal;

pub use connection::{ClientSession, Connection};
pub use portal::Portal;
pub use ring::{Consumer, Producer};
pub use service::{Service, ServiceConfig, ServiceSession, SessionArgs, SessionData};
