use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{BullyPriority, ClusterKey, NodeName, ProtocolError};

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}

/// Sign a message payload with the signing key.
pub fn sign_message(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify a message signature against the verifying key.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    payload: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    verifying_key
        .verify(payload, signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// Signed statement that a node coordinates a cluster under a given token.
///
/// Carried in every ANNOUNCE. Receivers verify the signature before adopting
/// the announced coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorCredential {
    pub coordinator: NodeName,
    pub cluster: ClusterKey,
    pub token: u64,
    pub priority: BullyPriority,
    /// Hex-encoded Ed25519 verifying key of the coordinator.
    pub public_key: String,
    /// Hex-encoded signature over the canonical payload.
    pub signature: String,
}

impl CoordinatorCredential {
    /// Issue a credential signed by the coordinator's key.
    pub fn issue(
        signing_key: &SigningKey,
        coordinator: NodeName,
        cluster: ClusterKey,
        token: u64,
        priority: BullyPriority,
    ) -> Result<Self, ProtocolError> {
        let payload = Self::signing_payload(&coordinator, &cluster, token, &priority)?;
        let signature = sign_message(signing_key, &payload);
        Ok(Self {
            coordinator,
            cluster,
            token,
            priority,
            public_key: hex::encode(signing_key.verifying_key().as_bytes()),
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// Canonical bytes for signing: JSON of (coordinator, cluster, token, priority).
    pub fn signing_payload(
        coordinator: &NodeName,
        cluster: &ClusterKey,
        token: u64,
        priority: &BullyPriority,
    ) -> Result<Vec<u8>, ProtocolError> {
        let canonical = serde_json::json!({
            "coordinator": coordinator,
            "cluster": cluster,
            "token": token,
            "priority": priority,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Check the signature against the embedded public key.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let key_bytes: [u8; 32] = hex::decode(&self.public_key)
            .map_err(|e| ProtocolError::Crypto(e.to_string()))?
            .try_into()
            .map_err(|_| ProtocolError::Crypto("public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| ProtocolError::Crypto(e.to_string()))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?
            .try_into()
            .map_err(|_| ProtocolError::InvalidSignature("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        let payload =
            Self::signing_payload(&self.coordinator, &self.cluster, self.token, &self.priority)?;
        verify_signature(&verifying_key, &payload, &signature)
    }

    /// Short fingerprint of the signing key, used in logs.
    pub fn fingerprint(&self) -> String {
        let digest = sha256(self.public_key.as_bytes());
        hex::encode(&digest[..6])
    }
}
