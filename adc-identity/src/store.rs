use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::IdentityError;

/// Narrow interface over the external document-store engine.
///
/// The engine itself (and its query language, indexes, and transactions)
/// is an external collaborator; the identity core only needs id-keyed
/// CRUD plus a single-field equality scan.
pub trait DocumentStore: Send + Sync + 'static {
    fn insert(
        &self,
        collection: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send;

    fn find(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, IdentityError>> + Send;

    fn find_all(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send;

    /// All documents whose top-level `field` equals `value`.
    fn find_by(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send;

    /// Replace a document. Returns `false` when the id does not exist.
    fn update(
        &self,
        collection: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> impl Future<Output = Result<bool, IdentityError>> + Send;

    /// Delete a document. Returns `false` when the id does not exist.
    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<bool, IdentityError>> + Send;
}

/// Object-safe wrapper for `DocumentStore`.
pub trait DocumentStoreErased: Send + Sync {
    fn insert<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        doc: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + 'a>>;
    fn find<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, IdentityError>> + Send + 'a>>;
    fn find_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send + 'a>>;
    fn find_by<'a>(
        &'a self,
        collection: &'a str,
        field: &'a str,
        value: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send + 'a>>;
    fn update<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        doc: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<bool, IdentityError>> + Send + 'a>>;
    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, IdentityError>> + Send + 'a>>;
}

impl<T: DocumentStore> DocumentStoreErased for T {
    fn insert<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        doc: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + 'a>> {
        Box::pin(DocumentStore::insert(self, collection, id, doc))
    }
    fn find<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, IdentityError>> + Send + 'a>>
    {
        Box::pin(DocumentStore::find(self, collection, id))
    }
    fn find_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send + 'a>>
    {
        Box::pin(DocumentStore::find_all(self, collection))
    }
    fn find_by<'a>(
        &'a self,
        collection: &'a str,
        field: &'a str,
        value: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send + 'a>>
    {
        Box::pin(DocumentStore::find_by(self, collection, field, value))
    }
    fn update<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        doc: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<bool, IdentityError>> + Send + 'a>> {
        Box::pin(DocumentStore::update(self, collection, id, doc))
    }
    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, IdentityError>> + Send + 'a>> {
        Box::pin(DocumentStore::delete(self, collection, id))
    }
}

/// In-memory document store for development and testing.
pub struct InMemoryDocumentStore {
    collections: DashMap<String, Arc<DashMap<String, serde_json::Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
        }
    }

    fn collection(&self, name: &str) -> Arc<DashMap<String, serde_json::Value>> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert(
        &self,
        collection: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> impl Future<Output = Result<(), IdentityError>> + Send {
        self.collection(collection).insert(id.to_string(), doc);
        std::future::ready(Ok(()))
    }

    fn find(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, IdentityError>> + Send {
        let result = self.collection(collection).get(id).map(|e| e.value().clone());
        std::future::ready(Ok(result))
    }

    fn find_all(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send {
        let result: Vec<serde_json::Value> = self
            .collection(collection)
            .iter()
            .map(|e| e.value().clone())
            .collect();
        std::future::ready(Ok(result))
    }

    fn find_by(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, IdentityError>> + Send {
        let result: Vec<serde_json::Value> = self
            .collection(collection)
            .iter()
            .filter(|e| e.value().get(field) == Some(value))
            .map(|e| e.value().clone())
            .collect();
        std::future::ready(Ok(result))
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> impl Future<Output = Result<bool, IdentityError>> + Send {
        let collection = self.collection(collection);
        let updated = if collection.contains_key(id) {
            collection.insert(id.to_string(), doc);
            true
        } else {
            false
        };
        std::future::ready(Ok(updated))
    }

    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<bool, IdentityError>> + Send {
        let removed = self.collection(collection).remove(id).is_some();
        std::future::ready(Ok(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crud_round_trip() {
        let store = InMemoryDocumentStore::new();
        store
            .insert("users", "u1", serde_json::json!({"id": "u1", "username": "alice"}))
            .await
            .unwrap();

        let found = store.find("users", "u1").await.unwrap().unwrap();
        assert_eq!(found["username"], "alice");

        assert!(store
            .update("users", "u1", serde_json::json!({"id": "u1", "username": "alice2"}))
            .await
            .unwrap());
        assert!(!store
            .update("users", "ghost", serde_json::json!({}))
            .await
            .unwrap());

        assert!(store.delete("users", "u1").await.unwrap());
        assert!(store.find("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_by_matches_top_level_field() {
        let store = InMemoryDocumentStore::new();
        for (id, org) in [("u1", "acme"), ("u2", "acme"), ("u3", "globex")] {
            store
                .insert("users", id, serde_json::json!({"id": id, "orgId": org}))
                .await
                .unwrap();
        }
        let acme = store
            .find_by("users", "orgId", &serde_json::json!("acme"))
            .await
            .unwrap();
        assert_eq!(acme.len(), 2);
    }
}
