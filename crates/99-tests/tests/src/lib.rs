//! End-to-end tests: descriptors exchanged over TCP, then offloaded
//! operations between the two contexts.

#[cfg(test)]
mod harness;

#[cfg(test)]
mod e2e;

#[cfg(test)]
mod handshake;
