//! Handshake and authentication messages.
//!
//! The access point speaks protobuf for its key-exchange and login frames.
//! The message set is small and frozen, so the structs are written by hand
//! with explicit field tags instead of running a codegen build step.

/// Cipher suites the client can offer during key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum Cryptosuite {
    Shannon = 0,
    Rc4Sha1Hmac = 1,
}

/// Authentication methods accepted by the login frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthenticationType {
    Password = 0,
    StoredCredentials = 1,
    AccessToken = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildInfo {
    #[prost(uint32, tag = "10")]
    pub product: u32,
    #[prost(uint32, tag = "30")]
    pub platform: u32,
    #[prost(uint64, tag = "40")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanHello {
    #[prost(bytes = "vec", tag = "10")]
    pub gc: Vec<u8>,
    #[prost(uint32, tag = "20")]
    pub server_keys_known: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoHelloUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanHello>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    #[prost(message, optional, tag = "10")]
    pub build_info: Option<BuildInfo>,
    #[prost(enumeration = "Cryptosuite", repeated, packed = "false", tag = "30")]
    pub cryptosuites_supported: Vec<i32>,
    #[prost(message, optional, tag = "50")]
    pub login_crypto_hello: Option<LoginCryptoHelloUnion>,
    #[prost(bytes = "vec", tag = "60")]
    pub client_nonce: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "70")]
    pub padding: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanChallenge {
    #[prost(bytes = "vec", tag = "10")]
    pub gs: Vec<u8>,
    #[prost(int32, tag = "20")]
    pub server_signature_key: i32,
    #[prost(bytes = "vec", tag = "30")]
    pub gs_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoChallengeUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanChallenge>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApChallenge {
    #[prost(message, optional, tag = "10")]
    pub login_crypto_challenge: Option<LoginCryptoChallengeUnion>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApLoginFailed {
    #[prost(int32, tag = "10")]
    pub error_code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApResponseMessage {
    #[prost(message, optional, tag = "10")]
    pub challenge: Option<ApChallenge>,
    #[prost(message, optional, tag = "30")]
    pub login_failed: Option<ApLoginFailed>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanResponse {
    #[prost(bytes = "vec", tag = "10")]
    pub hmac: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoResponseUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PoWResponseUnion {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CryptoResponseUnion {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientResponsePlaintext {
    #[prost(message, optional, tag = "10")]
    pub login_crypto_response: Option<LoginCryptoResponseUnion>,
    #[prost(message, optional, tag = "20")]
    pub pow_response: Option<PoWResponseUnion>,
    #[prost(message, optional, tag = "30")]
    pub crypto_response: Option<CryptoResponseUnion>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCredentials {
    #[prost(string, optional, tag = "10")]
    pub username: Option<String>,
    #[prost(enumeration = "AuthenticationType", tag = "20")]
    pub typ: i32,
    #[prost(bytes = "vec", optional, tag = "30")]
    pub auth_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemInfo {
    #[prost(string, optional, tag = "90")]
    pub system_information_string: Option<String>,
    #[prost(string, optional, tag = "100")]
    pub device_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientResponseEncrypted {
    #[prost(message, optional, tag = "10")]
    pub login_credentials: Option<LoginCredentials>,
    #[prost(message, optional, tag = "50")]
    pub system_info: Option<SystemInfo>,
    #[prost(string, optional, tag = "70")]
    pub version_string: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApWelcome {
    #[prost(string, tag = "10")]
    pub canonical_username: String,
    #[prost(enumeration = "AuthenticationType", tag = "20")]
    pub reusable_auth_credentials_type: i32,
    #[prost(bytes = "vec", tag = "30")]
    pub reusable_auth_credentials: Vec<u8>,
}
