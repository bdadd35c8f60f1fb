//! Operations and operation seals.
//!
//! Consensus treats the body of an operation as opaque; it is interpreted by
//! the operation processor registered for its `kind`.
use super::{Hash, Timestamp};
use crate::node::{InvalidSignatureError, NetworkId, PublicKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};

/// Content of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFact {
    /// Kind of the operation, selecting its processor.
    pub kind: String,
    /// Opaque body.
    pub body: serde_json::Value,
    /// Client-chosen nonce making otherwise equal facts distinct.
    pub token: String,
}

impl OperationFact {
    /// Content hash of the fact.
    pub fn hash(&self) -> Hash {
        Hash::of(self)
    }
}

/// Signature of an operation fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSign {
    /// Signer key.
    pub signer: PublicKey,
    /// Signature over `fact_hash ‖ network_id`.
    pub signature: Signature,
    /// Time of signing.
    pub signed_at: Timestamp,
}

/// Signed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Content.
    pub fact: OperationFact,
    /// Hash of `fact`.
    pub fact_hash: Hash,
    /// Signatures of the fact.
    pub fact_signs: Vec<FactSign>,
    /// Hash of `(fact_hash, fact_signs)`.
    pub hash: Hash,
}

/// Error returned by `Operation::verify` and `OperationSeal::verify`.
#[derive(Debug, thiserror::Error)]
pub enum OperationVerifyError {
    /// Hash does not match the content.
    #[error("hash mismatch")]
    BadHash,
    /// Operation is not signed.
    #[error("no fact signs")]
    Unsigned,
    /// A signature does not verify.
    #[error(transparent)]
    BadSignature(#[from] InvalidSignatureError),
    /// The seal contains no operations.
    #[error("empty operation seal")]
    Empty,
}

fn operation_hash(fact_hash: &Hash, fact_signs: &[FactSign]) -> Hash {
    Hash::of(&(fact_hash, fact_signs))
}

impl Operation {
    /// Signs a new operation.
    pub fn sign(
        fact: OperationFact,
        key: &SecretKey,
        network_id: &NetworkId,
        signed_at: Timestamp,
    ) -> Self {
        let fact_hash = fact.hash();
        let fact_signs = vec![FactSign {
            signer: key.public(),
            signature: key.sign(&fact_hash, network_id),
            signed_at,
        }];
        Self {
            hash: operation_hash(&fact_hash, &fact_signs),
            fact,
            fact_hash,
            fact_signs,
        }
    }

    /// Checks the hashes and all fact signs.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), OperationVerifyError> {
        if self.fact.hash() != self.fact_hash
            || operation_hash(&self.fact_hash, &self.fact_signs) != self.hash
        {
            return Err(OperationVerifyError::BadHash);
        }
        if self.fact_signs.is_empty() {
            return Err(OperationVerifyError::Unsigned);
        }
        for fs in &self.fact_signs {
            fs.signer
                .verify(&self.fact_hash, network_id, &fs.signature)?;
        }
        Ok(())
    }
}

/// Signed envelope carrying one or more operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSeal {
    /// Key of the submitter.
    pub signer: PublicKey,
    /// Operations.
    pub operations: Vec<Operation>,
    /// Time of signing.
    pub signed_at: Timestamp,
    /// Hash of `(signer, operations, signed_at)`; the seal hash.
    pub body_hash: Hash,
    /// Signature over `body_hash ‖ network_id`.
    pub signature: Signature,
}

fn seal_hash(signer: &PublicKey, operations: &[Operation], signed_at: &Timestamp) -> Hash {
    Hash::of(&(signer, operations, signed_at))
}

impl OperationSeal {
    /// Signs a new seal.
    pub fn sign(
        operations: Vec<Operation>,
        key: &SecretKey,
        network_id: &NetworkId,
        signed_at: Timestamp,
    ) -> Self {
        let signer = key.public();
        let body_hash = seal_hash(&signer, &operations, &signed_at);
        Self {
            signature: key.sign(&body_hash, network_id),
            signer,
            operations,
            signed_at,
            body_hash,
        }
    }

    /// Seal hash.
    pub fn hash(&self) -> Hash {
        self.body_hash
    }

    /// Checks the seal and every operation in it.
    pub fn verify(&self, network_id: &NetworkId) -> Result<(), OperationVerifyError> {
        if self.operations.is_empty() {
            return Err(OperationVerifyError::Empty);
        }
        if seal_hash(&self.signer, &self.operations, &self.signed_at) != self.body_hash {
            return Err(OperationVerifyError::BadHash);
        }
        self.signer
            .verify(&self.body_hash, network_id, &self.signature)?;
        for op in &self.operations {
            op.verify(network_id)?;
        }
        Ok(())
    }
}
