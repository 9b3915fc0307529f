//! Commit digest computation.
//!
//! Every transaction carries a running SHA-256 digest seeded from its id.
//! Each executed statement folds in the hash of its text and parameters.
//! The digest is sent on commit and the service answers with its own;
//! a mismatch means the service saw a different sequence of statements.
//!
//! Digests are combined with the *dot* operation: the two operands are
//! ordered by their signed bytes (compared from the last byte towards the
//! first), concatenated smaller-first, and hashed. Dot is commutative. An
//! empty operand contributes no bytes, so the result is the hash of the
//! other operand alone.

use crate::error::{DriverError, DriverResult};
use crate::types::TransactionId;
use ledger_codec::WireValue;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Size of a non-empty digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// A 256-bit digest, or the empty digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommitDigest {
    bytes: Option<[u8; DIGEST_SIZE]>,
}

impl CommitDigest {
    /// Returns the empty digest.
    pub fn empty() -> Self {
        Self { bytes: None }
    }

    /// Hashes arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self {
            bytes: Some(Sha256::digest(data).into()),
        }
    }

    /// Initial digest of a transaction.
    pub fn seed(transaction_id: &TransactionId) -> Self {
        Self::of(transaction_id.as_str().as_bytes())
    }

    /// Parses a digest received from the service.
    pub fn from_bytes(bytes: &[u8]) -> DriverResult<Self> {
        match bytes.len() {
            0 => Ok(Self::empty()),
            DIGEST_SIZE => {
                let mut buf = [0u8; DIGEST_SIZE];
                buf.copy_from_slice(bytes);
                Ok(Self { bytes: Some(buf) })
            }
            n => Err(DriverError::bad_request(format!(
                "digest must be empty or {DIGEST_SIZE} bytes, got {n}"
            ))),
        }
    }

    /// Returns the raw digest bytes (empty for the empty digest).
    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            Some(bytes) => bytes,
            None => &[],
        }
    }

    /// Returns true for the empty digest.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_none()
    }

    /// Combines two digests.
    pub fn dot(&self, other: &CommitDigest) -> CommitDigest {
        let mut hasher = Sha256::new();
        match (&self.bytes, &other.bytes) {
            (None, _) => hasher.update(other.as_bytes()),
            (_, None) => hasher.update(self.as_bytes()),
            (Some(a), Some(b)) => {
                let (first, second) = if compare(a, b) == Ordering::Less {
                    (a, b)
                } else {
                    (b, a)
                };
                hasher.update(first);
                hasher.update(second);
            }
        }
        CommitDigest {
            bytes: Some(hasher.finalize().into()),
        }
    }

    /// Digest of a single statement and its parameters.
    pub fn of_statement(statement: &str, parameters: &[WireValue]) -> CommitDigest {
        parameters
            .iter()
            .fold(Self::of(statement.as_bytes()), |acc, param| {
                acc.dot(&Self::of(param.as_bytes()))
            })
    }

    /// Folds a statement into this running digest.
    pub fn update(&mut self, statement: &str, parameters: &[WireValue]) {
        *self = self.dot(&Self::of_statement(statement, parameters));
    }
}

/// Orders two digests by signed byte value, last byte most significant.
fn compare(a: &[u8; DIGEST_SIZE], b: &[u8; DIGEST_SIZE]) -> Ordering {
    for i in (0..DIGEST_SIZE).rev() {
        let ord = (a[i] as i8).cmp(&(b[i] as i8));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl fmt::Debug for CommitDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitDigest(")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_with_last(last: u8) -> CommitDigest {
        let mut bytes = [0u8; DIGEST_SIZE];
        bytes[DIGEST_SIZE - 1] = last;
        CommitDigest::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn empty_operand_hashes_the_other() {
        let d = CommitDigest::of(b"statement");
        let rehashed = CommitDigest::of(d.as_bytes());
        assert_eq!(CommitDigest::empty().dot(&d), rehashed);
        assert_eq!(d.dot(&CommitDigest::empty()), rehashed);
        assert_ne!(CommitDigest::empty().dot(&d), d);
        assert_eq!(
            CommitDigest::empty().dot(&CommitDigest::empty()),
            CommitDigest::of(&[])
        );
    }

    #[test]
    fn dot_is_commutative() {
        let a = CommitDigest::of(b"a");
        let b = CommitDigest::of(b"b");
        assert_eq!(a.dot(&b), b.dot(&a));
        assert_ne!(a.dot(&b), a);
    }

    #[test]
    fn comparison_uses_signed_bytes() {
        // 0x80 is -128 as a signed byte, so it sorts before 0x01.
        let negative = digest_with_last(0x80);
        let positive = digest_with_last(0x01);
        let (a, b) = match (&negative.bytes, &positive.bytes) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!(),
        };
        assert_eq!(compare(a, b), Ordering::Less);

        let mut hasher = Sha256::new();
        hasher.update(negative.as_bytes());
        hasher.update(positive.as_bytes());
        let expected: [u8; DIGEST_SIZE] = hasher.finalize().into();
        assert_eq!(negative.dot(&positive).as_bytes(), &expected);
    }

    #[test]
    fn statement_digest_depends_on_parameters() {
        let p1 = WireValue::from(vec![1]);
        let p2 = WireValue::from(vec![2]);
        let a = CommitDigest::of_statement("SELECT * FROM t WHERE id = ?", &[p1.clone()]);
        let b = CommitDigest::of_statement("SELECT * FROM t WHERE id = ?", &[p2]);
        let c = CommitDigest::of_statement("SELECT * FROM t WHERE id = ?", &[p1]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn running_digest_is_deterministic() {
        let id = TransactionId::new("txn-42");
        let mut first = CommitDigest::seed(&id);
        let mut second = CommitDigest::seed(&id);
        for digest in [&mut first, &mut second] {
            digest.update("CREATE TABLE accounts", &[]);
            digest.update("INSERT INTO accounts ?, ?", &[WireValue::from(vec![9])]);
        }
        assert_eq!(first, second);
        assert_eq!(first.as_bytes().len(), DIGEST_SIZE);
    }

    #[test]
    fn from_bytes_rejects_bad_length() {
        assert!(CommitDigest::from_bytes(&[0u8; 7]).is_err());
        assert!(CommitDigest::from_bytes(&[]).unwrap().is_empty());
    }
}
