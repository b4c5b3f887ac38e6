//! Tag-indexed persistence for protocol-state records.
//!
//! Records serialize to opaque bodies stored under their category and id,
//! together with a set of derived tags. Tags are a secondary index: a pure
//! function of the record's current fields, recomputed before every
//! persist, never authoritative. The physical backend is external; this
//! module defines the [`StorageBackend`] trait plus an in-memory
//! implementation, and an aries-askar implementation behind the `askar`
//! feature.

#[cfg(feature = "askar")]
mod askar;
pub mod error;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[cfg(feature = "askar")]
pub use askar::AskarBackend;
pub use error::StorageError;

/// A stored tag value: a single string or an encoded list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Single(String),
    List(Vec<String>),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Single(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Single(value)
    }
}

impl From<Vec<String>> for TagValue {
    fn from(value: Vec<String>) -> Self {
        TagValue::List(value)
    }
}

/// The derived tag map persisted alongside a record body.
pub type RecordTags = BTreeMap<String, TagValue>;

/// One clause of a tag query.
#[derive(Debug, Clone, PartialEq)]
pub enum TagMatch {
    /// The stored value must equal the scalar; for list tags, the list
    /// must contain it.
    Is(String),
    /// The stored list value must contain every given element.
    Contains(Vec<String>),
}

/// A conjunction of tag clauses, as consumed by the query methods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagFilter {
    clauses: BTreeMap<String, TagMatch>,
}

impl TagFilter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is(mut self, key: &str, value: impl Into<String>) -> Self {
        self.clauses.insert(key.to_string(), TagMatch::Is(value.into()));
        self
    }

    pub fn contains(mut self, key: &str, values: Vec<String>) -> Self {
        self.clauses.insert(key.to_string(), TagMatch::Contains(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub(crate) fn clauses(&self) -> impl Iterator<Item = (&String, &TagMatch)> {
        self.clauses.iter()
    }

    /// Whether a tag map satisfies every clause.
    pub(crate) fn matches(&self, tags: &RecordTags) -> bool {
        self.clauses.iter().all(|(key, clause)| {
            let Some(value) = tags.get(key) else {
                return false;
            };

            match (value, clause) {
                (TagValue::Single(stored), TagMatch::Is(wanted)) => stored == wanted,
                (TagValue::List(stored), TagMatch::Is(wanted)) => stored.contains(wanted),
                (TagValue::List(stored), TagMatch::Contains(wanted)) => {
                    wanted.iter().all(|w| stored.contains(w))
                }
                (TagValue::Single(stored), TagMatch::Contains(wanted)) => {
                    wanted.iter().all(|w| w == stored)
                }
            }
        })
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "(all)");
        }

        for (i, (key, clause)) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match clause {
                TagMatch::Is(value) => write!(f, "{key}={value}")?,
                TagMatch::Contains(values) => write!(f, "{key}⊇{values:?}")?,
            }
        }

        Ok(())
    }
}

/// A persistable protocol-state record.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// The storage category this record type lives under.
    const RECORD_TYPE: &'static str;

    fn id(&self) -> &str;

    /// Derive the tag index from the record's current fields.
    fn tags(&self) -> RecordTags;
}

/// Durable key-value storage with tag metadata. Implementations must
/// serialize concurrent writes to the same id; they do not provide
/// optimistic-concurrency detection.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a new entry; storing an existing id is an error.
    async fn insert(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError>;

    /// Rewrite the body and tags of an existing entry.
    async fn replace(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError>;

    async fn fetch(&self, category: &'static str, id: &str)
    -> Result<Option<Vec<u8>>, StorageError>;

    async fn remove(&self, category: &'static str, id: &str) -> Result<(), StorageError>;

    /// All entries of a category whose tags satisfy the filter.
    async fn fetch_all(
        &self,
        category: &'static str,
        filter: &TagFilter,
    ) -> Result<Vec<Vec<u8>>, StorageError>;
}

/// Non-durable backend for tests and ephemeral agents.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<(&'static str, String), (Vec<u8>, RecordTags)>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn insert(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.write()?;
        let key = (category, id.to_string());
        if entries.contains_key(&key) {
            return Err(StorageError::Duplicate {
                category,
                id: id.to_string(),
            });
        }
        entries.insert(key, (value, tags));
        Ok(())
    }

    async fn replace(
        &self,
        category: &'static str,
        id: &str,
        value: Vec<u8>,
        tags: RecordTags,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.write()?;
        let key = (category, id.to_string());
        if !entries.contains_key(&key) {
            return Err(StorageError::NotFound {
                category,
                query: id.to_string(),
            });
        }
        entries.insert(key, (value, tags));
        Ok(())
    }

    async fn fetch(
        &self,
        category: &'static str,
        id: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read()?;
        Ok(entries
            .get(&(category, id.to_string()))
            .map(|(value, _)| value.clone()))
    }

    async fn remove(&self, category: &'static str, id: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write()?;
        entries.remove(&(category, id.to_string()));
        Ok(())
    }

    async fn fetch_all(
        &self,
        category: &'static str,
        filter: &TagFilter,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let entries = self.entries.read()?;
        Ok(entries
            .iter()
            .filter(|((cat, _), (_, tags))| *cat == category && filter.matches(tags))
            .map(|(_, (value, _))| value.clone())
            .collect())
    }
}

/// Typed record persistence over a storage backend.
///
/// All record types share one query convention: `find_*` methods return
/// empty results on absence, `get_single_by_query` fails loudly.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Persist a new record together with its derived tags.
    pub async fn save<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        tracing::debug!(category = R::RECORD_TYPE, id = record.id(), "saving record");
        self.backend
            .insert(
                R::RECORD_TYPE,
                record.id(),
                serde_json::to_vec(record)?,
                record.tags(),
            )
            .await
    }

    /// Rewrite an existing record, recomputing its tags. The caller is
    /// responsible for having advanced `updated_at` via the record's own
    /// mutation methods.
    pub async fn update<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        tracing::debug!(category = R::RECORD_TYPE, id = record.id(), "updating record");
        self.backend
            .replace(
                R::RECORD_TYPE,
                record.id(),
                serde_json::to_vec(record)?,
                record.tags(),
            )
            .await
    }

    pub async fn find_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError> {
        match self.backend.fetch(R::RECORD_TYPE, id).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Like [`RecordStore::find_by_id`], but fails with
    /// [`StorageError::NotFound`] on absence.
    pub async fn get_by_id<R: Record>(&self, id: &str) -> Result<R, StorageError> {
        self.find_by_id(id).await?.ok_or(StorageError::NotFound {
            category: R::RECORD_TYPE,
            query: id.to_string(),
        })
    }

    pub async fn delete<R: Record>(&self, id: &str) -> Result<(), StorageError> {
        self.backend.remove(R::RECORD_TYPE, id).await
    }

    pub async fn find_by_query<R: Record>(
        &self,
        filter: &TagFilter,
    ) -> Result<Vec<R>, StorageError> {
        let values = self.backend.fetch_all(R::RECORD_TYPE, filter).await?;
        values
            .iter()
            .map(|value| serde_json::from_slice(value).map_err(StorageError::from))
            .collect()
    }

    /// First match or none; the caller asserts uniqueness where the
    /// domain guarantees it.
    pub async fn find_single_by_query<R: Record>(
        &self,
        filter: &TagFilter,
    ) -> Result<Option<R>, StorageError> {
        Ok(self.find_by_query(filter).await?.into_iter().next())
    }

    /// Like [`RecordStore::find_single_by_query`], but fails with
    /// [`StorageError::NotFound`] on zero matches.
    pub async fn get_single_by_query<R: Record>(
        &self,
        filter: &TagFilter,
    ) -> Result<R, StorageError> {
        self.find_single_by_query(filter)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                category: R::RECORD_TYPE,
                query: filter.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn record(id: &str, owner: &str, keys: &[&str]) -> TestRecord {
        TestRecord {
            id: id.into(),
            owner: owner.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn save_and_find_by_id() {
        let store = RecordStore::in_memory();
        let rec = record("r1", "alice", &["k1"]);

        store.save(&rec).await.unwrap();
        let found: TestRecord = store.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(found, rec);

        assert!(store.find_by_id::<TestRecord>("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_save_is_rejected() {
        let store = RecordStore::in_memory();
        let rec = record("r1", "alice", &[]);

        store.save(&rec).await.unwrap();
        assert!(matches!(
            store.save(&rec).await,
            Err(StorageError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn update_recomputes_tags() {
        let store = RecordStore::in_memory();
        let mut rec = record("r1", "alice", &[]);
        store.save(&rec).await.unwrap();

        rec.owner = "bob".into();
        store.update(&rec).await.unwrap();

        let by_old: Vec<TestRecord> = store
            .find_by_query(&TagFilter::new().is("owner", "alice"))
            .await
            .unwrap();
        assert!(by_old.is_empty());

        let by_new: TestRecord = store
            .get_single_by_query(&TagFilter::new().is("owner", "bob"))
            .await
            .unwrap();
        assert_eq!(by_new.id, "r1");
    }

    #[tokio::test]
    async fn query_clauses_are_anded() {
        let store = RecordStore::in_memory();
        store.save(&record("r1", "alice", &["k1", "k2"])).await.unwrap();
        store.save(&record("r2", "alice", &["k3"])).await.unwrap();
        store.save(&record("r3", "bob", &["k1"])).await.unwrap();

        let filter = TagFilter::new()
            .is("owner", "alice")
            .contains("keys", vec!["k1".into()]);
        let found: Vec<TestRecord> = store.find_by_query(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "r1");

        // scalar match against a list tag means membership
        let filter = TagFilter::new().is("keys", "k3");
        let found: Vec<TestRecord> = store.find_by_query(&filter).await.unwrap();
        assert_eq!(found[0].id, "r2");
    }

    #[tokio::test]
    async fn get_single_fails_loudly_on_zero_matches() {
        let store = RecordStore::in_memory();
        let filter = TagFilter::new().is("owner", "nobody");

        let err = store
            .get_single_by_query::<TestRecord>(&filter)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { category: "test", .. }));

        store.save(&record("r1", "alice", &[])).await.unwrap();
        let found: TestRecord = store
            .get_single_by_query(&TagFilter::new().is("owner", "alice"))
            .await
            .unwrap();
        assert_eq!(found.id, "r1");
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = RecordStore::in_memory();
        store.save(&record("r1", "alice", &[])).await.unwrap();

        store.delete::<TestRecord>("r1").await.unwrap();
        assert!(store.find_by_id::<TestRecord>("r1").await.unwrap().is_none());
    }
}
