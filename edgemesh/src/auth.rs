//! Caller identity and token issuance.
//!
//! The scheduler consumes verified identities; transports hand tokens to
//! [`TokenService`] and pass the resulting [`Identity`] down. Tokens are
//! opaque random strings with a type prefix:
//!
//! - Node token: `em_nt_<32 random bytes base64url>`
//! - Job token:  `em_jt_<32 random bytes base64url>`
//!
//! Only SHA-256 hashes are kept at rest. Job tokens are bound to a single
//! task id and, by default, consumed on first use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{MeshError, MeshResult};
use crate::node::NodeId;
use crate::task::TaskId;

pub const NODE_TOKEN_PREFIX: &str = "em_nt_";
pub const JOB_TOKEN_PREFIX: &str = "em_jt_";

const TOKEN_BYTES: usize = 32;

/// A verified caller. Produced by [`TokenService`] or by secret checks;
/// every scheduler operation takes one of these, never a raw token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Identity {
    Admin,
    Bootstrap,
    Node(NodeId),
    Producer { task_id: TaskId },
}

impl Identity {
    pub fn require_admin(&self) -> MeshResult<()> {
        match self {
            Self::Admin => Ok(()),
            _ => Err(MeshError::Unauthorized),
        }
    }

    /// The caller must be the named node.
    pub fn require_node(&self, node_id: &NodeId) -> MeshResult<()> {
        match self {
            Self::Node(id) if id == node_id => Ok(()),
            _ => Err(MeshError::TokenNodeMismatch(node_id.clone())),
        }
    }
}

#[derive(Clone, Debug)]
struct TokenRecord {
    identity: Identity,
    expires_at: DateTime<Utc>,
    single_use: bool,
}

/// Mints and verifies node and job tokens.
pub struct TokenService {
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    tokens: Mutex<HashMap<String, TokenRecord>>,
    spent: Mutex<HashSet<String>>,
}

fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

impl TokenService {
    pub fn new(clock: Arc<dyn Clock>, config: AuthConfig) -> Self {
        Self {
            clock,
            config,
            tokens: Mutex::new(HashMap::new()),
            spent: Mutex::new(HashSet::new()),
        }
    }

    /// Verify the bootstrap secret presented at node registration.
    /// An unset secret denies everyone.
    pub fn verify_bootstrap(&self, secret: &str) -> MeshResult<Identity> {
        match self.config.bootstrap_secret.as_deref() {
            Some(expected) if expected == secret => Ok(Identity::Bootstrap),
            _ => Err(MeshError::NodeBootstrapDenied),
        }
    }

    /// Verify the admin secret. An unset secret denies everyone.
    pub fn verify_admin(&self, secret: &str) -> MeshResult<Identity> {
        match self.config.admin_secret.as_deref() {
            Some(expected) if expected == secret => Ok(Identity::Admin),
            _ => Err(MeshError::Unauthorized),
        }
    }

    /// Mint a node identity token.
    pub fn issue_node_token(&self, node_id: NodeId) -> String {
        let token = generate_token(NODE_TOKEN_PREFIX);
        let expires_at =
            self.clock.now() + Duration::seconds(self.config.node_token_ttl_secs as i64);
        self.tokens.lock().insert(
            hash_token(&token),
            TokenRecord {
                identity: Identity::Node(node_id),
                expires_at,
                single_use: false,
            },
        );
        token
    }

    /// Mint a job token bound to one task id.
    pub fn issue_job_token(&self, task_id: TaskId) -> String {
        let token = generate_token(JOB_TOKEN_PREFIX);
        let expires_at =
            self.clock.now() + Duration::seconds(self.config.job_token_ttl_secs as i64);
        self.tokens.lock().insert(
            hash_token(&token),
            TokenRecord {
                identity: Identity::Producer { task_id },
                expires_at,
                single_use: self.config.job_token_single_use,
            },
        );
        token
    }

    /// Verify any token and return the identity it carries.
    pub fn verify(&self, token: &str) -> MeshResult<Identity> {
        let hash = hash_token(token);
        let record = {
            let tokens = self.tokens.lock();
            tokens.get(&hash).cloned()
        };
        let Some(record) = record else {
            return Err(MeshError::TokenSignatureInvalid);
        };

        if self.clock.now() > record.expires_at {
            self.tokens.lock().remove(&hash);
            return Err(MeshError::TokenExpired);
        }

        if record.single_use {
            let mut spent = self.spent.lock();
            if !spent.insert(hash.clone()) {
                return Err(MeshError::TokenReplay);
            }
        }

        Ok(record.identity)
    }

    /// Verify a node token from a transport header.
    pub fn verify_node_token(&self, token: Option<&str>) -> MeshResult<NodeId> {
        let token = token.ok_or(MeshError::MissingNodeToken)?;
        match self.verify(token)? {
            Identity::Node(node_id) => Ok(node_id),
            _ => Err(MeshError::TokenSignatureInvalid),
        }
    }

    /// Verify a job token from a transport header.
    pub fn verify_job_token(&self, token: Option<&str>) -> MeshResult<TaskId> {
        let token = token.ok_or(MeshError::MissingJobToken)?;
        match self.verify(token)? {
            Identity::Producer { task_id } => Ok(task_id),
            _ => Err(MeshError::TokenSignatureInvalid),
        }
    }

    /// Rotate a node token: verify the old one, revoke it, mint a fresh
    /// one for the same node.
    pub fn rotate_node_token(&self, token: &str) -> MeshResult<(NodeId, String)> {
        let node_id = match self.verify(token)? {
            Identity::Node(node_id) => node_id,
            _ => return Err(MeshError::TokenSignatureInvalid),
        };
        self.tokens.lock().remove(&hash_token(token));
        let fresh = self.issue_node_token(node_id.clone());
        Ok((node_id, fresh))
    }

    /// Drop every token held for a node. Used on revocation.
    pub fn revoke_node_tokens(&self, node_id: &NodeId) {
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, record| !matches!(&record.identity, Identity::Node(id) if id == node_id));
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("tokens", &self.tokens.lock().len())
            .field("spent", &self.spent.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn service(config: AuthConfig) -> TokenService {
        TokenService::new(Arc::new(SystemClock), config)
    }

    fn secrets() -> AuthConfig {
        AuthConfig {
            admin_secret: Some("admin-secret".to_string()),
            bootstrap_secret: Some("boot-secret".to_string()),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn bootstrap_secret_is_checked() {
        let tokens = service(secrets());
        assert_eq!(
            tokens.verify_bootstrap("boot-secret").expect("accepted"),
            Identity::Bootstrap
        );
        assert_eq!(
            tokens.verify_bootstrap("wrong").expect_err("denied").code(),
            "node_bootstrap_denied"
        );
    }

    #[test]
    fn unset_secrets_deny_everyone() {
        let tokens = service(AuthConfig::default());
        assert!(tokens.verify_bootstrap("anything").is_err());
        assert_eq!(
            tokens.verify_admin("anything").expect_err("denied").code(),
            "unauthorized"
        );
    }

    #[test]
    fn node_token_round_trip() {
        let tokens = service(secrets());
        let token = tokens.issue_node_token(NodeId::from("n1"));
        assert!(token.starts_with(NODE_TOKEN_PREFIX));
        assert_eq!(
            tokens.verify_node_token(Some(&token)).expect("valid"),
            NodeId::from("n1")
        );
    }

    #[test]
    fn missing_and_garbage_tokens_are_named_errors() {
        let tokens = service(secrets());
        assert_eq!(
            tokens.verify_node_token(None).expect_err("missing").code(),
            "missing_node_token"
        );
        assert_eq!(
            tokens
                .verify_node_token(Some("em_nt_garbage"))
                .expect_err("invalid")
                .code(),
            "token_signature_invalid"
        );
        assert_eq!(
            tokens.verify_job_token(None).expect_err("missing").code(),
            "missing_job_token"
        );
    }

    #[test]
    fn job_token_is_single_use() {
        let tokens = service(secrets());
        let token = tokens.issue_job_token(TaskId::from("t1"));
        assert_eq!(
            tokens.verify_job_token(Some(&token)).expect("first use"),
            TaskId::from("t1")
        );
        assert_eq!(
            tokens
                .verify_job_token(Some(&token))
                .expect_err("replayed")
                .code(),
            "token_replay"
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let config = AuthConfig {
            node_token_ttl_secs: 0,
            ..secrets()
        };
        let tokens = service(config);
        let token = tokens.issue_node_token(NodeId::from("n1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(
            tokens
                .verify_node_token(Some(&token))
                .expect_err("expired")
                .code(),
            "token_expired"
        );
    }

    #[test]
    fn rotation_revokes_the_old_token() {
        let tokens = service(secrets());
        let old = tokens.issue_node_token(NodeId::from("n1"));
        let (node_id, fresh) = tokens.rotate_node_token(&old).expect("rotate");
        assert_eq!(node_id, NodeId::from("n1"));
        assert_ne!(old, fresh);
        assert!(tokens.verify(&old).is_err());
        assert!(tokens.verify(&fresh).is_ok());
    }

    #[test]
    fn revoking_a_node_drops_its_tokens() {
        let tokens = service(secrets());
        let a = tokens.issue_node_token(NodeId::from("n1"));
        let b = tokens.issue_node_token(NodeId::from("n2"));
        tokens.revoke_node_tokens(&NodeId::from("n1"));
        assert!(tokens.verify(&a).is_err());
        assert!(tokens.verify(&b).is_ok());
    }

    #[test]
    fn identity_checks() {
        assert!(Identity::Admin.require_admin().is_ok());
        assert!(Identity::Bootstrap.require_admin().is_err());
        assert!(Identity::Node(NodeId::from("n1"))
            .require_node(&NodeId::from("n1"))
            .is_ok());
        assert_eq!(
            Identity::Node(NodeId::from("n2"))
                .require_node(&NodeId::from("n1"))
                .expect_err("mismatch")
                .code(),
            "token_node_mismatch"
        );
    }
}
