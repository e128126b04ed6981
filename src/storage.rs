//! The storage adapter contract (C3) and its in-memory reference
//! implementation.
//!
//! A real deployment backs each vnode with an embedded ordered-key engine
//! (out of scope here — treated as an external collaborator per the
//! project's scope). [`MemStorage`] stands in for it: a `BTreeMap` behind a
//! `parking_lot::RwLock`, ordered the same way a real engine's key range
//! scan would be, so `fold`/`fold_keys` iterate in the order the Merkle
//! tree (`reconciliation/merkle.rs`) expects.
use crate::error::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

/// One operation in a [`Storage::batch`] call.
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// The storage adapter contract every vnode talks to. Implementations own
/// their own locking; callers never see partial writes from a `batch`.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Visit every `(key, value)` pair in ascending key order.
    fn fold(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;

    /// Visit every key (no value) in ascending order — cheaper than
    /// `fold` for anti-entropy passes that only need keys.
    fn fold_keys(&self, f: &mut dyn FnMut(&[u8]) -> Result<(), StorageError>) -> Result<(), StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError>;

    /// Irreversibly remove the underlying engine's files/state. Callers
    /// should treat `self` as unusable afterward.
    fn destroy(&self) -> Result<(), StorageError>;
}

/// Open an engine with retry: up to `max_retries` attempts, sleeping
/// `backoff` between each, surfacing `StorageError::LockContention` if
/// every attempt fails. Engines that hold an exclusive file lock (e.g. a
/// crashed peer process slow to release it) need this; `MemStorage`
/// itself never contends, but shares the helper so the retry policy is
/// exercised the same way a real engine would use it.
pub async fn open_retrying<F, T>(
    mut try_open: F,
    max_retries: u32,
    backoff: Duration,
) -> Result<T, StorageError>
where
    F: FnMut() -> Result<T, StorageError>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match try_open() {
            Ok(v) => return Ok(v),
            Err(_) if attempts < max_retries => {
                tokio::time::sleep(backoff).await;
            }
            Err(_) => return Err(StorageError::LockContention { attempts }),
        }
    }
}

/// Default open-retry policy: 5 attempts at 2s backoff.
pub const OPEN_RETRIES: u32 = 5;
pub const OPEN_BACKOFF: Duration = Duration::from_millis(2000);

/// Default destroy-retry policy: 2 attempts.
pub const DESTROY_RETRIES: u32 = 2;

/// Remove an engine's on-disk state with a short retry budget — unlike
/// open, a destroy failure after retries is reported, not silently
/// dropped; callers decide whether to leak the directory or escalate.
pub async fn destroy_retrying<F>(mut try_destroy: F, max_retries: u32) -> Result<(), StorageError>
where
    F: FnMut() -> Result<(), StorageError>,
{
    let mut attempts = 0;
    let mut last_err = String::new();
    loop {
        attempts += 1;
        match try_destroy() {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = e.to_string();
                if attempts >= max_retries {
                    return Err(StorageError::DestroyFailed {
                        attempts,
                        reason: last_err,
                    });
                }
            }
        }
    }
}

/// In-memory ordered store. Not persistent — a process restart loses all
/// data, which is acceptable for the reference implementation since the
/// real engine this stands in for is explicitly out of scope.
#[derive(Default)]
pub struct MemStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut guard = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    guard.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    guard.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn fold(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        for (k, v) in self.data.read().iter() {
            f(k, v)?;
        }
        Ok(())
    }

    fn fold_keys(&self, f: &mut dyn FnMut(&[u8]) -> Result<(), StorageError>) -> Result<(), StorageError> {
        for k in self.data.read().keys() {
            f(k)?;
        }
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.data.read().is_empty())
    }

    fn destroy(&self) -> Result<(), StorageError> {
        self.data.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let s = MemStorage::new();
        s.put(b"a", b"1").unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
        s.delete(b"a").unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
    }

    #[test]
    fn fold_visits_in_ascending_key_order() {
        let s = MemStorage::new();
        s.put(b"b", b"2").unwrap();
        s.put(b"a", b"1").unwrap();
        s.put(b"c", b"3").unwrap();
        let mut seen = Vec::new();
        s.fold(&mut |k, _| {
            seen.push(k.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn batch_applies_all_ops_atomically_from_readers_perspective() {
        let s = MemStorage::new();
        s.put(b"a", b"1").unwrap();
        s.batch(vec![
            BatchOp::Put(b"b".to_vec(), b"2".to_vec()),
            BatchOp::Delete(b"a".to_vec()),
        ])
        .unwrap();
        assert_eq!(s.get(b"a").unwrap(), None);
        assert_eq!(s.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn is_empty_reflects_contents() {
        let s = MemStorage::new();
        assert!(s.is_empty().unwrap());
        s.put(b"a", b"1").unwrap();
        assert!(!s.is_empty().unwrap());
    }

    #[tokio::test]
    async fn open_retrying_succeeds_after_transient_contention() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), StorageError> = open_retrying(
            || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(StorageError::LockContention { attempts: n })
                } else {
                    Ok(())
                }
            },
            OPEN_RETRIES,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn open_retrying_gives_up_after_max_retries() {
        let result: Result<(), StorageError> = open_retrying(
            || Err(StorageError::LockContention { attempts: 0 }),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result, Err(StorageError::LockContention { attempts: 3 }));
    }

    #[tokio::test]
    async fn destroy_retrying_reports_failure_after_budget() {
        let result = destroy_retrying(
            || Err(StorageError::Backend("locked".into())),
            DESTROY_RETRIES,
        )
        .await;
        assert!(matches!(
            result,
            Err(StorageError::DestroyFailed { attempts: 2, .. })
        ));
    }
}
