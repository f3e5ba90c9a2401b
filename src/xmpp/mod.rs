pub mod auth;
pub mod bridge;
pub mod framing;
pub mod mitm;
pub mod router;
pub mod stanzas;
