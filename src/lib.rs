//! Estuary — a federated, TLS-secured chat relay.
//!
//! Every node is both a server (accepting TLS connections and relaying
//! packets between them) and a client (connected to one peer node). Messages
//! carry an origin id and sequence number so relays can drop duplicates as
//! packets echo through the mesh, and gaps can be backfilled on request.

pub mod chat;
