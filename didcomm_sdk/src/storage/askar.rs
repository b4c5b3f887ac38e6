use aries_askar::{
    ErrorKind, Store, StoreKeyMethod,
    entry::{EntryOperation, EntryTag},
};
use async_trait::async_trait;

use super::{RecordTags, StorageBackend, StorageError, TagFilter, TagMatch, TagValue};

/// Durable storage backed by an Aries Askar store. Record bodies and tags
/// are encrypted at rest under the store key.
pub struct AskarBackend {
    inner: Store,
    url: String,
}

impl AskarBackend {
    /// Provision a new store at `url`, erasing any existing one.
    pub async fn provision(url: &str, password: &[u8]) -> Result<Self, StorageError> {
        let pass_key = Store::new_raw_key(Some(password))?;
        let inner = Store::provision(url, StoreKeyMethod::RawKey, pass_key, None, true).await?;

        Ok(Self {
            inner,
            url: url.to_string(),
        })
    }

    /// Open an existing store at `url`.
    pub async fn open(url: &str, password: &[u8]) -> Result<Self, StorageError> {
        let pass_key = Store::new_raw_key(Some(password))?;
        let inner = Store::open(url, Some(StoreKeyMethod::RawKey), pass_key, None).await?;

        Ok(Self {
            inner,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn close(self) -> Result<(), StorageError> {
        self.inner.close().await?;
        Ok(())
    }
}

/// List tags become repeated entry tags under the same name, which is how
/// askar models multi-valued tags.
fn to_entry_tags(tags: &RecordTags) -> Vec<EntryTag> {
    let mut entry_tags = Vec::new();
    for (name, value) in tags {
        match value {
            TagValue::Single(value) => {
                entry_tags.push(EntryTag::Encrypted(name.clone(), value.clone()));
            }
            TagValue::List(values) => {
                for value in values {
                    entry_tags.push(EntryTag::Encrypted(name.clone(), value.clone()));
                }
            }
        }
    }
    entry_tags
}

/// An `is_eq` clause matches any of a repeated tag's values, so both
/// scalar equality and list membership translate to `is_eq`, and a
/// contains clause to a conjunction of them.
fn to_askar_filter(filter: &TagFilter) -> Option<aries_askar::entry::TagFilter> {
    let mut clauses = Vec::new();
    for (key, clause) in filter.clauses() {
        match clause {
            TagMatch::Is(value) => {
                clauses.push(aries_askar::entry::TagFilter::is_eq(key.clone(), value.clone()));
            }
            TagMatch::Contains(values) => {
                for value in values {
                    clauses.push(aries_askar::entry::TagFilter::is_eq(key.clone(), value.clone()));
                }
            }
        }
    }

    if clauses.is_empty() {
        None
    } else {
        Some(aries_askar::entry::TagFilter::all_of(clauses))
    }
}

#[async_trait]
impl StorageBackend for AskarBackend {
    async fn insert(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError> {
        let mut conn = self.inner.session(None).await?;

        if let Err(e) = conn
            .insert(category, id, &value, Some(&to_entry_tags(&tags)), None)
            .await
        {
            if e.kind() == ErrorKind::Duplicate {
                return Err(StorageError::Duplicate {
                    category,
                    id: id.to_string(),
                });
            }
            return Err(e.into());
        }

        conn.commit().await?;
        Ok(())
    }

    async fn replace(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError> {
        let mut conn = self.inner.session(None).await?;

        if let Err(e) = conn
            .update(
                EntryOperation::Replace,
                category,
                id,
                Some(&value),
                Some(&to_entry_tags(&tags)),
                None,
            )
            .await
        {
            if e.kind() == ErrorKind::NotFound {
                return Err(StorageError::NotFound {
                    category,
                    query: id.to_string(),
                });
            }
            return Err(e.into());
        }

        conn.commit().await?;
        Ok(())
    }

    async fn fetch(
        &self,
        category: &'static str,
        id: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.inner.session(None).await?;
        Ok(conn
            .fetch(category, id, false)
            .await?
            .map(|entry| entry.value.to_vec()))
    }

    async fn remove(&self, category: &'static str, id: &str) -> Result<(), StorageError> {
        let mut conn = self.inner.session(None).await?;

        if let Err(e) = conn.remove(category, id).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        conn.commit().await?;
        Ok(())
    }

    async fn fetch_all(
        &self,
        category: &'static str,
        filter: &TagFilter,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut conn = self.inner.session(None).await?;
        let entries = conn
            .fetch_all(Some(category), to_askar_filter(filter), None, None, false, false)
            .await?;

        Ok(entries.iter().map(|entry| entry.value.to_vec()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Record, RecordStore};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRecord {
        id: String,
        owner: String,
        keys: Vec<String>,
    }

    impl Record for TestRecord {
        const RECORD_TYPE: &'static str = "test";

        fn id(&self) -> &str {
            &self.id
        }

        fn tags(&self) -> RecordTags {
            let mut tags = RecordTags::new();
            tags.insert("owner".into(), self.owner.as_str().into());
            tags.insert("keys".into(), self.keys.clone().into());
            tags
        }
    }

    #[tokio::test]
    async fn askar_round_trip_and_tag_query() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("records.sqlite").display());

        let backend = AskarBackend::provision(&url, b"unit-test-password")
            .await
            .unwrap();
        let store = RecordStore::new(Arc::new(backend));

        let rec = TestRecord {
            id: "r1".into(),
            owner: "alice".into(),
            keys: vec!["k1".into(), "k2".into()],
        };
        store.save(&rec).await.unwrap();

        let found: TestRecord = store.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(found, rec);

        // membership match against the repeated tag
        let by_key: TestRecord = store
            .get_single_by_query(&TagFilter::new().is("keys", "k2"))
            .await
            .unwrap();
        assert_eq!(by_key.id, "r1");

        let mut updated = rec.clone();
        updated.owner = "bob".into();
        store.update(&updated).await.unwrap();

        let by_old: Option<TestRecord> = store
            .find_single_by_query(&TagFilter::new().is("owner", "alice"))
            .await
            .unwrap();
        assert!(by_old.is_none());

        store.delete::<TestRecord>("r1").await.unwrap();
        assert!(store.find_by_id::<TestRecord>("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn askar_duplicate_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("records.sqlite").display());

        let backend = AskarBackend::provision(&url, b"unit-test-password")
            .await
            .unwrap();
        let store = RecordStore::new(Arc::new(backend));

        let rec = TestRecord {
            id: "r1".into(),
            owner: "alice".into(),
            keys: vec![],
        };
        store.save(&rec).await.unwrap();
        assert!(matches!(
            store.save(&rec).await,
            Err(StorageError::Duplicate { .. })
        ));
    }
}
