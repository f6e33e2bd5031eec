//! User authentication messages (RFC 4252, RFC 4256) and the prompt seam.
//!
//! The client tries methods in a fixed order: `none`, `publickey`,
//! `keyboard-interactive`, then `password`. Anything that needs a human
//! answer goes through an [`AuthPrompter`].
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new("alice", "ssh-connection", AuthMethod::None);
//! let bytes = request.to_bytes();
//! assert_eq!(AuthRequest::from_bytes(&bytes).unwrap(), request);
//! ```

use crate::ssh::message::{MessageType, USERAUTH_INFO_REQUEST};
use crate::ssh::wire::{
    expect_message, put_bool, put_string, read_bool, read_name_list, read_string, read_u32,
    read_utf8,
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use wisp_platform::{WispError, WispResult};
use zeroize::Zeroize;

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Authentication method carried in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Probe; learns which methods the server allows.
    None,
    /// Plaintext password.
    Password(String),
    /// Public key, with the signature on the second pass.
    PublicKey {
        /// Signature algorithm name.
        algorithm: String,
        /// Public key blob.
        public_key: Vec<u8>,
        /// Signature blob, absent on the query pass.
        signature: Option<Vec<u8>>,
    },
    /// Challenge-response (RFC 4256).
    KeyboardInteractive {
        /// Comma-separated submethod hints, usually empty.
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        put_string(&mut buf, self.user_name.as_bytes());
        put_string(&mut buf, self.service_name.as_bytes());
        put_string(&mut buf, self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                put_bool(&mut buf, false);
                put_string(&mut buf, password.as_bytes());
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                put_bool(&mut buf, signature.is_some());
                put_string(&mut buf, algorithm.as_bytes());
                put_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    put_string(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                put_string(&mut buf, b"");
                put_string(&mut buf, submethods.as_bytes());
            }
        }

        buf.to_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for malformed data or an
    /// unknown method.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::UserauthRequest as u8, "USERAUTH_REQUEST")?;
        let mut offset = 1;

        let user_name = read_utf8(data, &mut offset)?;
        let service_name = read_utf8(data, &mut offset)?;
        let method_name = read_utf8(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = read_bool(data, &mut offset)?;
                AuthMethod::Password(read_utf8(data, &mut offset)?)
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_utf8(data, &mut offset)?;
                let public_key = read_string(data, &mut offset)?.to_vec();
                let signature = if has_signature {
                    Some(read_string(data, &mut offset)?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = read_string(data, &mut offset)?;
                AuthMethod::KeyboardInteractive {
                    submethods: read_utf8(data, &mut offset)?,
                }
            }
            other => {
                return Err(WispError::ProtocolViolation(format!(
                    "Unsupported authentication method '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure listing the methods that may continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that may continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns true if `method` may continue.
    pub fn allows(&self, method: &str) -> bool {
        self.methods_can_continue.iter().any(|m| m == method)
    }

    /// Returns the partial success flag.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        put_string(&mut buf, self.methods_can_continue.join(",").as_bytes());
        put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::UserauthFailure as u8, "USERAUTH_FAILURE")?;
        let mut offset = 1;
        let methods_can_continue = read_name_list(data, &mut offset)?;
        let partial_success = read_bool(data, &mut offset)?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        put_string(&mut buf, self.message.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses the message. Invalid UTF-8 is replaced rather than rejected.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::UserauthBanner as u8, "USERAUTH_BANNER")?;
        let mut offset = 1;
        let message = String::from_utf8_lossy(read_string(data, &mut offset)?).into_owned();
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates the message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the accepted algorithm.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the accepted key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        put_string(&mut buf, self.algorithm.as_bytes());
        put_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::UserauthPkOk as u8, "USERAUTH_PK_OK")?;
        let mut offset = 1;
        let algorithm = read_utf8(data, &mut offset)?;
        let public_key = read_string(data, &mut offset)?.to_vec();
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Text shown to the user.
    pub text: String,
    /// Whether the answer may be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Challenge name, often empty.
    pub name: String,
    /// Instruction text, often empty.
    pub instruction: String,
    /// Prompts in display order.
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(USERAUTH_INFO_REQUEST);
        put_string(&mut buf, self.name.as_bytes());
        put_string(&mut buf, self.instruction.as_bytes());
        put_string(&mut buf, b"");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            put_string(&mut buf, prompt.text.as_bytes());
            put_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, USERAUTH_INFO_REQUEST, "USERAUTH_INFO_REQUEST")?;
        let mut offset = 1;
        let name = read_utf8(data, &mut offset)?;
        let instruction = read_utf8(data, &mut offset)?;
        let _language = read_string(data, &mut offset)?;
        let count = read_u32(data, &mut offset)? as usize;

        // Each prompt needs at least five bytes; bound the allocation by that.
        if count > data.len().saturating_sub(offset) / 5 {
            return Err(WispError::ProtocolViolation(format!(
                "USERAUTH_INFO_REQUEST claims {} prompts",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = read_utf8(data, &mut offset)?;
            let echo = read_bool(data, &mut offset)?;
            prompts.push(Prompt { text, echo });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    responses: Vec<String>,
}

impl InfoResponse {
    /// Wraps the answers, one per prompt.
    pub fn new(responses: Vec<String>) -> Self {
        Self { responses }
    }

    /// Returns the answers.
    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            put_string(&mut buf, response.as_bytes());
        }
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(
            data,
            MessageType::UserauthInfoResponse as u8,
            "USERAUTH_INFO_RESPONSE",
        )?;
        let mut offset = 1;
        let count = read_u32(data, &mut offset)? as usize;
        if count > data.len().saturating_sub(offset) / 4 {
            return Err(WispError::ProtocolViolation(format!(
                "USERAUTH_INFO_RESPONSE claims {} answers",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(read_utf8(data, &mut offset)?);
        }
        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        for response in &mut self.responses {
            response.zeroize();
        }
    }
}

/// Builds SSH_MSG_SERVICE_REQUEST.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    put_string(&mut buf, service.as_bytes());
    buf.to_vec()
}

/// Builds SSH_MSG_SERVICE_ACCEPT.
pub fn service_accept(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceAccept as u8);
    put_string(&mut buf, service.as_bytes());
    buf.to_vec()
}

/// Returns the service name carried by SERVICE_REQUEST or SERVICE_ACCEPT.
pub fn parse_service_name(data: &[u8]) -> WispResult<String> {
    match data.first().copied().and_then(MessageType::from_u8) {
        Some(MessageType::ServiceRequest | MessageType::ServiceAccept) => {
            let mut offset = 1;
            read_utf8(data, &mut offset)
        }
        _ => Err(WispError::ProtocolViolation(
            "Expected SERVICE_REQUEST or SERVICE_ACCEPT".to_string(),
        )),
    }
}

/// Bytes signed for publickey authentication (RFC 4252 Section 7).
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    put_string(&mut buf, user_name.as_bytes());
    put_string(&mut buf, service_name.as_bytes());
    put_string(&mut buf, b"publickey");
    put_bool(&mut buf, true);
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, public_key_blob);
    buf.to_vec()
}

/// Source of answers for authentication and host key questions.
///
/// Returning `Ok(None)` from an answer method skips that method.
#[async_trait]
pub trait AuthPrompter: Send {
    /// Asks for the password of `user@host`.
    async fn password(&mut self, user: &str, host: &str) -> WispResult<Option<String>>;

    /// Answers a keyboard-interactive round. Must return one answer per prompt.
    async fn keyboard_interactive(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> WispResult<Option<Vec<String>>>;

    /// Shows a server banner.
    async fn banner(&mut self, message: &str) -> WispResult<()> {
        tracing::info!(banner = %message.trim_end(), "Server banner");
        Ok(())
    }

    /// Asks whether to trust an unknown host key.
    async fn confirm_host_key(
        &mut self,
        _host: &str,
        _port: u16,
        _key_type: &str,
        _fingerprint: &str,
    ) -> WispResult<bool> {
        Ok(false)
    }
}

/// A prompter that never answers. Only `none` and `publickey` can succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompter;

#[async_trait]
impl AuthPrompter for NoPrompter {
    async fn password(&mut self, _user: &str, _host: &str) -> WispResult<Option<String>> {
        Ok(None)
    }

    async fn keyboard_interactive(
        &mut self,
        _name: &str,
        _instruction: &str,
        _prompts: &[Prompt],
    ) -> WispResult<Option<Vec<String>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_request_layout() {
        let request = AuthRequest::new(
            "alice",
            CONNECTION_SERVICE,
            AuthMethod::Password("secret".to_string()),
        );
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 50);

        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.service_name(), "ssh-connection");
        assert_eq!(parsed.method().name(), "password");
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_publickey_request_with_and_without_signature() {
        let query = AuthRequest::new(
            "bob",
            CONNECTION_SERVICE,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let parsed = AuthRequest::from_bytes(&query.to_bytes()).unwrap();
        assert!(matches!(
            parsed.method(),
            AuthMethod::PublicKey { signature: None, .. }
        ));

        let signed = AuthRequest::new(
            "bob",
            CONNECTION_SERVICE,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: Some(vec![9; 8]),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&signed.to_bytes()).unwrap(), signed);
    }

    #[test]
    fn test_keyboard_interactive_request() {
        let request = AuthRequest::new(
            "carol",
            CONNECTION_SERVICE,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.method().name(), "keyboard-interactive");
    }

    #[test]
    fn test_request_rejects_unknown_method() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        put_string(&mut buf, b"alice");
        put_string(&mut buf, b"ssh-connection");
        put_string(&mut buf, b"hostbased");
        assert!(matches!(
            AuthRequest::from_bytes(&buf),
            Err(WispError::ProtocolViolation(_))
        ));
        assert!(AuthRequest::from_bytes(&[51]).is_err());
    }

    #[test]
    fn test_failure_message() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], false);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert!(parsed.allows("password"));
        assert!(!parsed.allows("keyboard-interactive"));
        assert!(!parsed.partial_success());
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_banner_and_pk_ok() {
        let banner = AuthBanner::new("Authorized use only\n");
        assert_eq!(
            AuthBanner::from_bytes(&banner.to_bytes()).unwrap().message(),
            "Authorized use only\n"
        );

        let ok = AuthPkOk::new("ssh-ed25519", vec![4, 5, 6]);
        let parsed = AuthPkOk::from_bytes(&ok.to_bytes()).unwrap();
        assert_eq!(parsed.algorithm(), "ssh-ed25519");
        assert_eq!(parsed.public_key(), &[4, 5, 6]);
        assert!(AuthPkOk::from_bytes(&[52]).is_err());
    }

    #[test]
    fn test_info_request_and_response() {
        let request = InfoRequest {
            name: "OTP".to_string(),
            instruction: "Enter your codes".to_string(),
            prompts: vec![
                Prompt {
                    text: "Password: ".to_string(),
                    echo: false,
                },
                Prompt {
                    text: "Token: ".to_string(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&request.to_bytes()).unwrap(), request);

        let response = InfoResponse::new(vec!["hunter2".into(), "123456".into()]);
        let parsed = InfoResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(parsed.responses(), response.responses());
    }

    #[test]
    fn test_info_request_rejects_absurd_count() {
        let mut buf = BytesMut::new();
        buf.put_u8(USERAUTH_INFO_REQUEST);
        put_string(&mut buf, b"");
        put_string(&mut buf, b"");
        put_string(&mut buf, b"");
        buf.put_u32(u32::MAX);
        assert!(InfoRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_service_messages() {
        assert_eq!(
            parse_service_name(&service_request(USERAUTH_SERVICE)).unwrap(),
            "ssh-userauth"
        );
        assert_eq!(
            parse_service_name(&service_accept(USERAUTH_SERVICE)).unwrap(),
            "ssh-userauth"
        );
        assert!(parse_service_name(&[1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_construct_signature_data() {
        let data = construct_signature_data(
            &[0xAA; 32],
            "alice",
            CONNECTION_SERVICE,
            "ssh-ed25519",
            &[1, 2, 3],
        );

        let mut offset = 0;
        assert_eq!(read_string(&data, &mut offset).unwrap(), &[0xAA; 32]);
        assert_eq!(data[offset], 50);
        offset += 1;
        assert_eq!(read_utf8(&data, &mut offset).unwrap(), "alice");
        assert_eq!(read_utf8(&data, &mut offset).unwrap(), "ssh-connection");
        assert_eq!(read_utf8(&data, &mut offset).unwrap(), "publickey");
        assert!(read_bool(&data, &mut offset).unwrap());
        assert_eq!(read_utf8(&data, &mut offset).unwrap(), "ssh-ed25519");
        assert_eq!(read_string(&data, &mut offset).unwrap(), &[1, 2, 3]);
        assert_eq!(offset, data.len());
    }

    #[tokio::test]
    async fn test_no_prompter_declines() {
        let mut prompter = NoPrompter;
        assert_eq!(prompter.password("alice", "host").await.unwrap(), None);
        assert!(!prompter
            .confirm_host_key("host", 22, "ssh-ed25519", "SHA256:x")
            .await
            .unwrap());
        prompter.banner("hello").await.unwrap();
    }
}
