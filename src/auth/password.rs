use crate::auth::{authorization_address, AuthFailure, AuthProvider, AuthStream, Authenticated};
use crate::program_config::{validate_secret, ConfigError, MAX_SECRET_LENGTH};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;

/// Bytes stripped from both ends of the received credential
const TRIMMED_BYTES: &[u8] = b"\r\n\t\0";

/// Shared-secret authentication: the client sends the password as its first (and only) message.
pub struct PasswordAuthProvider {
    secret: Vec<u8>,
}

impl PasswordAuthProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let secret = secret.into();
        validate_secret(&secret)?;
        Ok(Self { secret })
    }

    fn matches(&self, credential: &[u8]) -> bool {
        // Lengths are not secret, the contents are
        credential.len() == self.secret.len() && bool::from(credential.ct_eq(&self.secret))
    }
}

impl AuthProvider for PasswordAuthProvider {
    fn name(&self) -> &'static str {
        "password"
    }

    fn authenticate<'a>(
        &'a self,
        stream: &'a mut dyn AuthStream,
        peer_address: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<Authenticated, AuthFailure>> + Send + 'a>> {
        Box::pin(async move {
            // A single read of at most one credential; anything beyond is ignored
            let mut buffer = [0u8; MAX_SECRET_LENGTH];
            let len = stream.read(&mut buffer).await?;

            if !self.matches(trim(&buffer[..len])) {
                return Err(AuthFailure::Rejected);
            }

            let address = authorization_address(peer_address).ok_or(AuthFailure::Rejected)?;
            Ok(Authenticated {
                address,
                expiry: None,
            })
        })
    }
}

fn trim(mut input: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = input {
        if !TRIMMED_BYTES.contains(first) {
            break;
        }
        input = rest;
    }
    while let [rest @ .., last] = input {
        if !TRIMMED_BYTES.contains(last) {
            break;
        }
        input = rest;
    }
    input
}
