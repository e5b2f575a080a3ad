//! rodsclient-tests: end-to-end coverage of the connection.
//!
//! A scripted fake server drives the client through negotiation, the TLS
//! bootstrap, native login and pipelining over in-memory duplex streams and
//! real loopback sockets. Property tests exercise the wire format against
//! truncated and hostile input.

pub mod fake_server;
pub mod harness;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod proptest_wire;
