//! Linux conntrack event consumer.
//!
//! Hooks into the kernel's connection-tracking subsystem over an
//! AF_NETLINK socket, dumps the existing table across network namespaces,
//! then streams new-connection events. Under an event storm the consumer
//! trips a circuit breaker, tears down the socket, and reopens it with a
//! kernel-side classic-BPF sampling filter tuned toward the configured
//! rate target.
//!
//! The [`consumer::Consumer`] delivers raw framed netlink messages;
//! decoding conntrack payloads is left to downstream code.

pub mod breaker;
pub mod cli;
pub mod consumer;
pub mod error;
pub mod kernel;
pub mod netlink;
pub mod ns;
pub mod pool;
pub mod privilege;
pub mod sampler;

pub use consumer::{Consumer, Event, Stats};
pub use error::CtError;
