//! Row version chains.
//!
//! MVCC-managed trees store a version chain as the tree value, newest
//! version first:
//!
//!   per version: [created_by: u64 BE] [deleted_by: u64 BE] [data_len: u32 BE] [data]
//!
//! `deleted_by == 0` means live. Stamps are transaction ids; the manager
//! resolves them to commit timestamps for visibility. Within a chain the
//! creation stamps strictly decrease head-to-tail (i.e. strictly increase in
//! chain order), and at most one version is live.

use crate::error::{Result, TurError};

pub type TxnId = u64;

pub const VERSION_HEADER: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVersion {
    pub created_by: TxnId,
    /// 0 = live.
    pub deleted_by: TxnId,
    pub data: Vec<u8>,
}

impl RowVersion {
    pub fn live(&self) -> bool {
        self.deleted_by == 0
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.created_by.to_be_bytes());
        buf.extend_from_slice(&self.deleted_by.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
    }

    /// Parse one version off the front of `data`; returns bytes consumed.
    pub fn deserialize(data: &[u8]) -> Result<(RowVersion, usize)> {
        if data.len() < VERSION_HEADER {
            return Err(TurError::Corruption("row version too short".into()));
        }
        let created_by = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let deleted_by = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let data_len = u32::from_be_bytes(data[16..20].try_into().unwrap()) as usize;
        if data.len() < VERSION_HEADER + data_len {
            return Err(TurError::Corruption("row version data truncated".into()));
        }
        Ok((
            RowVersion {
                created_by,
                deleted_by,
                data: data[VERSION_HEADER..VERSION_HEADER + data_len].to_vec(),
            },
            VERSION_HEADER + data_len,
        ))
    }
}

/// Decode a whole chain (newest first).
pub fn decode_chain(mut data: &[u8]) -> Result<Vec<RowVersion>> {
    let mut chain = Vec::new();
    while !data.is_empty() {
        let (version, consumed) = RowVersion::deserialize(data)?;
        chain.push(version);
        data = &data[consumed..];
    }
    Ok(chain)
}

pub fn encode_chain(chain: &[RowVersion]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(chain.iter().map(|v| VERSION_HEADER + v.data.len()).sum());
    for version in chain {
        version.serialize_into(&mut buf);
    }
    buf
}

/// Prepend a new version written by `txn`, marking the previous live version
/// deleted by the same transaction.
pub fn chain_put(chain: &mut Vec<RowVersion>, txn: TxnId, data: Vec<u8>) {
    for version in chain.iter_mut() {
        if version.live() {
            version.deleted_by = txn;
        }
    }
    chain.insert(
        0,
        RowVersion {
            created_by: txn,
            deleted_by: 0,
            data,
        },
    );
}

/// Mark the live version deleted by `txn`. Returns false when the chain has
/// no live version (already deleted).
pub fn chain_delete(chain: &mut [RowVersion], txn: TxnId) -> bool {
    for version in chain.iter_mut() {
        if version.live() {
            version.deleted_by = txn;
            return true;
        }
    }
    false
}

/// Reverse everything `txn` did to this chain: drop the versions it created
/// and revive the ones it marked deleted. Returns the surviving chain.
pub fn chain_undo(chain: Vec<RowVersion>, txn: TxnId) -> Vec<RowVersion> {
    let mut out = Vec::with_capacity(chain.len());
    for mut version in chain {
        if version.created_by == txn {
            continue;
        }
        if version.deleted_by == txn {
            version.deleted_by = 0;
        }
        out.push(version);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_roundtrip() {
        let v = RowVersion {
            created_by: 42,
            deleted_by: 99,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let mut buf = Vec::new();
        v.serialize_into(&mut buf);
        let (decoded, consumed) = RowVersion::deserialize(&buf).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn chain_roundtrip_preserves_order() {
        let chain = vec![
            RowVersion {
                created_by: 9,
                deleted_by: 0,
                data: b"newest".to_vec(),
            },
            RowVersion {
                created_by: 5,
                deleted_by: 9,
                data: b"older".to_vec(),
            },
        ];
        let decoded = decode_chain(&encode_chain(&chain)).unwrap();
        assert_eq!(decoded, chain);
    }

    #[test]
    fn put_marks_previous_live_deleted() {
        let mut chain = Vec::new();
        chain_put(&mut chain, 3, b"a".to_vec());
        chain_put(&mut chain, 7, b"b".to_vec());

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].created_by, 7);
        assert!(chain[0].live());
        assert_eq!(chain[1].created_by, 3);
        assert_eq!(chain[1].deleted_by, 7);
        // Creation stamps strictly increase newest-to-oldest reversed.
        assert!(chain[0].created_by > chain[1].created_by);
        assert_eq!(chain.iter().filter(|v| v.live()).count(), 1);
    }

    #[test]
    fn delete_hits_only_the_live_version() {
        let mut chain = Vec::new();
        chain_put(&mut chain, 3, b"a".to_vec());
        assert!(chain_delete(&mut chain, 5));
        assert!(!chain_delete(&mut chain, 6), "no live version remains");
        assert_eq!(chain[0].deleted_by, 5);
    }

    #[test]
    fn undo_removes_creations_and_revives_deletions() {
        let mut chain = Vec::new();
        chain_put(&mut chain, 3, b"a".to_vec());
        chain_put(&mut chain, 7, b"b".to_vec()); // deletes v3, creates v7

        let chain = chain_undo(chain, 7);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].created_by, 3);
        assert!(chain[0].live());
    }

    #[test]
    fn undo_can_empty_a_chain() {
        let mut chain = Vec::new();
        chain_put(&mut chain, 3, b"only".to_vec());
        assert!(chain_undo(chain, 3).is_empty());
    }

    #[test]
    fn truncated_chain_is_corruption() {
        let mut chain = Vec::new();
        chain_put(&mut chain, 3, b"abcdef".to_vec());
        let bytes = encode_chain(&chain);
        assert!(decode_chain(&bytes[..bytes.len() - 2]).is_err());
    }
}
