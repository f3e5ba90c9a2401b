//! Self-signed TLS identity generation for XmppMITM's loopback listener.
//!
//! The Riot client is told (via ConfigMITM's `chat.allow_bad_cert.enabled`
//! rewrite) to skip certificate validation on this connection, so any
//! self-signed cert for the target domain works — it never needs to chain
//! to a real CA.

use native_tls::Identity;
use rcgen::{generate_simple_self_signed, CertifiedKey};

/// Generates a fresh self-signed certificate for `domain` and wraps it as
/// a `native_tls::Identity` usable by a `TlsAcceptor`.
pub fn generate_self_signed_identity(domain: &str) -> anyhow::Result<Identity> {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec![domain.to_string()])?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    Ok(Identity::from_pkcs8(cert_pem.as_bytes(), key_pem.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_identity_succeeds() {
        let identity = generate_self_signed_identity("chat-affinity.jp1.pvp.net");
        assert!(identity.is_ok());
    }
}
