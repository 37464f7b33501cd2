//! # AP handshake
//!
//! Establishes the encrypted channel with the access point:
//!
//! 1. A Diffie-Hellman exchange over the fixed 768-bit group (g = 2).
//! 2. RSA-2048 / PKCS#1 v1.5 / SHA-1 verification of the server's public
//!    value against the pinned service key.
//! 3. HMAC-SHA1 key derivation over the exact bytes exchanged so far,
//!    yielding the challenge response plus the two Shannon direction keys.
//!
//! The returned [`ApCodec`] is primed with both keys and zeroed nonces.

use std::time::Duration;

use hmac::{Hmac, Mac};
use num_bigint_dig::BigUint;
use prost::Message;
use rand::RngCore;
use rsa::{
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
    RsaPublicKey,
};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{codec::ApCodec, error::HandshakeError, proto};

type HmacSha1 = Hmac<Sha1>;

/// 768-bit Oakley prime used for the key exchange (generator is 2).
const DH_PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Pinned RSA-2048 modulus of the service signing key (exponent 65537).
const SERVER_KEY_MODULUS: [u8; 256] = [
    0xac, 0xe0, 0x46, 0x0b, 0xff, 0xc2, 0x30, 0xaf, 0xf4, 0x6b, 0xfe, 0xc3, 0xbf, 0xbf, 0x86,
    0x3d, 0xa1, 0x91, 0xc6, 0xcc, 0x33, 0x6c, 0x93, 0xa1, 0x4f, 0xb3, 0xb0, 0x16, 0x12, 0xac,
    0xac, 0x6a, 0xf1, 0x80, 0xe7, 0xf6, 0x14, 0xd9, 0x42, 0x9d, 0xbe, 0x2e, 0x34, 0x66, 0x43,
    0xe3, 0x62, 0xd2, 0x32, 0x7a, 0x1a, 0x0d, 0x92, 0x3b, 0xae, 0xdd, 0x14, 0x02, 0xb1, 0x81,
    0x55, 0x05, 0x61, 0x04, 0xd5, 0x2c, 0x96, 0xa4, 0x4c, 0x1e, 0xcc, 0x02, 0x4a, 0xd4, 0xb2,
    0x0c, 0x00, 0x1f, 0x17, 0xed, 0xc2, 0x2f, 0xc4, 0x35, 0x21, 0xc8, 0xf0, 0xcb, 0xae, 0xd2,
    0xad, 0xd7, 0x2b, 0x0f, 0x9d, 0xb3, 0xc5, 0x32, 0x1a, 0x2a, 0xfe, 0x59, 0xf3, 0x5a, 0x0d,
    0xac, 0x68, 0xf1, 0xfa, 0x62, 0x1e, 0xfb, 0x2c, 0x8d, 0x0c, 0xb7, 0x39, 0x2d, 0x92, 0x47,
    0xe3, 0xd7, 0x35, 0x1a, 0x6d, 0xbd, 0x24, 0xc2, 0xae, 0x25, 0x5b, 0x88, 0xff, 0xab, 0x73,
    0x29, 0x8a, 0x0b, 0xcc, 0xcd, 0x0c, 0x58, 0x67, 0x31, 0x89, 0xe8, 0xbd, 0x34, 0x80, 0x78,
    0x4a, 0x5f, 0xc9, 0x6b, 0x89, 0x9d, 0x95, 0x6b, 0xfc, 0x86, 0xd7, 0x4f, 0x33, 0xa6, 0x78,
    0x17, 0x96, 0xc9, 0xc3, 0x2d, 0x0d, 0x32, 0xa5, 0xab, 0xcd, 0x05, 0x27, 0xe2, 0xf7, 0x10,
    0xa3, 0x96, 0x13, 0xc4, 0x2f, 0x99, 0xc0, 0x27, 0xbf, 0xed, 0x04, 0x9c, 0x3c, 0x27, 0x58,
    0x04, 0xb6, 0xb2, 0x19, 0xf9, 0xc1, 0x2f, 0x02, 0xe9, 0x48, 0x63, 0xec, 0xa1, 0xb6, 0x42,
    0xa0, 0x9d, 0x48, 0x25, 0xf8, 0xb3, 0x9d, 0xd0, 0xe8, 0x6a, 0xf9, 0x48, 0x4d, 0xa1, 0xc2,
    0xba, 0x86, 0x30, 0x42, 0xea, 0x9d, 0xb3, 0x08, 0x6c, 0x19, 0x0e, 0x48, 0xb3, 0x9d, 0x66,
    0xeb, 0x00, 0x06, 0xa2, 0x5a, 0xee, 0xa1, 0x1b, 0x13, 0x87, 0x3c, 0xd7, 0x19, 0xe6, 0x55,
    0xbd,
];

/// Accepted private scalar lengths.
const DH_KEY_LENGTHS: [usize; 2] = [95, 96];

/// Padding byte carried by the client hello.
const HELLO_PADDING: u8 = 0x1e;

/// Returns the pinned service signing key.
pub fn default_server_key() -> RsaPublicKey {
    RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&SERVER_KEY_MODULUS),
        rsa::BigUint::from(65537u32),
    )
    .expect("pinned server key is well-formed")
}

/// Client-side ephemeral Diffie-Hellman key pair.
pub struct DhLocalKeys {
    private: BigUint,
    public: Vec<u8>,
}

impl DhLocalKeys {
    /// Generates a fresh 95-byte private scalar.
    pub fn random() -> Self {
        let mut bytes = [0u8; 95];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_private_bytes(&bytes).expect("generated scalar has a valid length")
    }

    /// Builds a key pair from raw private scalar bytes (95 or 96 bytes).
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if !DH_KEY_LENGTHS.contains(&bytes.len()) {
            return Err(HandshakeError::InvalidKeyLength {
                expected: 95,
                actual: bytes.len(),
            });
        }
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let private = BigUint::from_bytes_be(bytes);
        let public = BigUint::from(2u32).modpow(&private, &prime);
        Ok(Self {
            private,
            public: public.to_bytes_be(),
        })
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Computes the shared secret from the server's public value.
    pub fn shared_secret(&self, remote: &[u8]) -> Vec<u8> {
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        BigUint::from_bytes_be(remote)
            .modpow(&self.private, &prime)
            .to_bytes_be()
    }
}

/// Keys derived from the handshake transcript.
pub struct HandshakeKeys {
    pub challenge: Vec<u8>,
    pub send_key: Vec<u8>,
    pub recv_key: Vec<u8>,
}

/// Derives the challenge response and the two Shannon keys.
///
/// One hundred bytes are produced as `HMAC-SHA1(shared, transcript || [i])`
/// for `i` in `1..=5`; the first twenty key the transcript MAC and the next
/// two 32-byte runs become the send and receive keys.
pub fn derive_keys(shared_secret: &[u8], transcript: &[u8]) -> HandshakeKeys {
    let mut data = Vec::with_capacity(100);
    for i in 1u8..=5 {
        let mut mac =
            HmacSha1::new_from_slice(shared_secret).expect("HMAC accepts any key length");
        mac.update(transcript);
        mac.update(&[i]);
        data.extend_from_slice(&mac.finalize().into_bytes());
    }

    let mut mac = HmacSha1::new_from_slice(&data[..20]).expect("HMAC accepts any key length");
    mac.update(transcript);
    let challenge = mac.finalize().into_bytes().to_vec();

    HandshakeKeys {
        challenge,
        send_key: data[20..52].to_vec(),
        recv_key: data[52..84].to_vec(),
    }
}

/// Verifies the server's signature over its public DH value.
pub fn verify_server_signature(
    server_key: &RsaPublicKey,
    gs: &[u8],
    signature: &[u8],
) -> Result<(), HandshakeError> {
    let verifying_key = VerifyingKey::<Sha1>::new(server_key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|_| HandshakeError::ServerVerificationFailed)?;
    verifying_key
        .verify(gs, &signature)
        .map_err(|_| HandshakeError::ServerVerificationFailed)
}

/// Applies the per-message deadline to one handshake I/O step.
async fn timed<F, T>(limit: Duration, step: F) -> Result<T, HandshakeError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HandshakeError::NetworkError(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake message timed out",
        ))),
    }
}

/// Runs the client side of the handshake and returns a primed codec.
///
/// `message_timeout` bounds each of the three wire exchanges separately.
pub async fn perform<S>(
    stream: &mut S,
    server_key: &RsaPublicKey,
    message_timeout: Duration,
) -> Result<ApCodec, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    perform_with_keys(stream, server_key, message_timeout, DhLocalKeys::random()).await
}

/// Handshake with caller-provided DH keys (used by tests).
pub async fn perform_with_keys<S>(
    stream: &mut S,
    server_key: &RsaPublicKey,
    message_timeout: Duration,
    local_keys: DhLocalKeys,
) -> Result<ApCodec, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transcript = Vec::new();

    // Client hello, preceded by the literal 0x00 0x04 marker and the
    // 4-byte big-endian total frame size (both counted in the size).
    let mut client_nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut client_nonce);

    let hello = proto::ClientHello {
        build_info: Some(proto::BuildInfo {
            product: 0,
            platform: 0,
            version: 1,
        }),
        cryptosuites_supported: vec![proto::Cryptosuite::Shannon as i32],
        login_crypto_hello: Some(proto::LoginCryptoHelloUnion {
            diffie_hellman: Some(proto::LoginCryptoDiffieHellmanHello {
                gc: local_keys.public_bytes().to_vec(),
                server_keys_known: 1,
            }),
        }),
        client_nonce: client_nonce.to_vec(),
        padding: Some(vec![HELLO_PADDING]),
    };

    let body = hello.encode_to_vec();
    let size = 2 + 4 + body.len();
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&[0x00, 0x04]);
    frame.extend_from_slice(&(size as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    timed(message_timeout, async {
        stream.write_all(&frame).await?;
        stream.flush().await
    })
    .await?;
    transcript.extend_from_slice(&frame);

    // Server response: 4-byte big-endian size (counted), then the body.
    let mut size_buf = [0u8; 4];
    timed(message_timeout, stream.read_exact(&mut size_buf)).await?;
    let total = u32::from_be_bytes(size_buf) as usize;
    if total < 4 {
        return Err(HandshakeError::ProtocolError(format!(
            "response frame size too small: {total}"
        )));
    }
    let mut body = vec![0u8; total - 4];
    timed(message_timeout, stream.read_exact(&mut body)).await?;
    transcript.extend_from_slice(&size_buf);
    transcript.extend_from_slice(&body);

    let response = proto::ApResponseMessage::decode(body.as_slice())
        .map_err(|e| HandshakeError::ProtocolError(format!("bad response message: {e}")))?;

    if let Some(failed) = response.login_failed {
        return Err(HandshakeError::ProtocolError(format!(
            "access point refused the hello (code {})",
            failed.error_code
        )));
    }

    let challenge = response
        .challenge
        .and_then(|c| c.login_crypto_challenge)
        .and_then(|c| c.diffie_hellman)
        .ok_or_else(|| {
            HandshakeError::ProtocolError("response carries no DH challenge".to_string())
        })?;

    verify_server_signature(server_key, &challenge.gs, &challenge.gs_signature)?;

    let shared = local_keys.shared_secret(&challenge.gs);
    let keys = derive_keys(&shared, &transcript);

    // Challenge response, 4-byte big-endian size prefix (counted).
    let answer = proto::ClientResponsePlaintext {
        login_crypto_response: Some(proto::LoginCryptoResponseUnion {
            diffie_hellman: Some(proto::LoginCryptoDiffieHellmanResponse {
                hmac: keys.challenge.clone(),
            }),
        }),
        pow_response: Some(proto::PoWResponseUnion {}),
        crypto_response: Some(proto::CryptoResponseUnion {}),
    };
    let body = answer.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    timed(message_timeout, async {
        stream.write_all(&frame).await?;
        stream.flush().await
    })
    .await?;

    tracing::debug!("handshake complete, channel keys derived");

    ApCodec::new(&keys.send_key, &keys.recv_key)
        .map_err(|e| HandshakeError::ProtocolError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_private_scalar_length() {
        assert!(matches!(
            DhLocalKeys::from_private_bytes(&[1u8; 10]),
            Err(HandshakeError::InvalidKeyLength { actual: 10, .. })
        ));
        assert!(DhLocalKeys::from_private_bytes(&[1u8; 95]).is_ok());
        assert!(DhLocalKeys::from_private_bytes(&[1u8; 96]).is_ok());
    }

    #[test]
    fn shared_secret_agrees() {
        let a = DhLocalKeys::from_private_bytes(&[3u8; 95]).unwrap();
        let b = DhLocalKeys::from_private_bytes(&[7u8; 95]).unwrap();
        assert_eq!(
            a.shared_secret(b.public_bytes()),
            b.shared_secret(a.public_bytes())
        );
    }

    #[test]
    fn key_derivation_is_deterministic_and_disjoint() {
        let keys = derive_keys(b"shared-secret", b"transcript bytes");
        let again = derive_keys(b"shared-secret", b"transcript bytes");
        assert_eq!(keys.challenge, again.challenge);
        assert_eq!(keys.send_key, again.send_key);
        assert_eq!(keys.recv_key, again.recv_key);

        assert_eq!(keys.challenge.len(), 20);
        assert_eq!(keys.send_key.len(), 32);
        assert_eq!(keys.recv_key.len(), 32);
        assert_ne!(keys.send_key, keys.recv_key);

        let other = derive_keys(b"shared-secret", b"different transcript");
        assert_ne!(keys.challenge, other.challenge);
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let key = default_server_key();
        let err = verify_server_signature(&key, b"gs-bytes", &[0u8; 256]).unwrap_err();
        assert!(matches!(err, HandshakeError::ServerVerificationFailed));
    }
}
