// Scoped knowledge-base search capability
//
// Bound to an immutable set of KB IDs at host construction. Every search
// runs RBAC first and always carries the binding down into the search
// service; an empty binding short-circuits before any query. Results are a
// structured JSON envelope rather than a Result, because errors here are
// data for the calling plugin (and ultimately the LLM), not control flow.
//
// Field and operator sets are closed; search results omit content and
// embeddings - get_document is the only entry point returning content.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::traits::{KbAccess, KbAccessDecision, KbSearchService};

pub const PAGE_SIZE: u32 = 20;

/// Type of a searchable field, deciding which operators apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Text,
    JsonbArray,
    JsonbObject,
}

impl FieldType {
    fn operators(&self) -> &'static [&'static str] {
        match self {
            FieldType::Text => &["eq", "contains", "icontains"],
            FieldType::JsonbArray => &["contains", "has_key", "has_any"],
            FieldType::JsonbObject => &["contains", "has_key", "path_contains"],
        }
    }
}

const CHUNK_FIELDS: &[(&str, FieldType)] = &[
    ("content", FieldType::Text),
    ("title", FieldType::Text),
    ("tags", FieldType::JsonbArray),
    ("metadata", FieldType::JsonbObject),
];

const DOCUMENT_FIELDS: &[(&str, FieldType)] = &[
    ("title", FieldType::Text),
    ("source_uri", FieldType::Text),
    ("labels", FieldType::JsonbArray),
    ("metadata", FieldType::JsonbObject),
];

fn lookup_field(fields: &[(&str, FieldType)], name: &str) -> Option<FieldType> {
    fields
        .iter()
        .find(|(f, _)| *f == name)
        .map(|(_, t)| *t)
}

fn error_envelope(code: &str, message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "error": {"code": code, "message": message.into()},
    })
}

pub struct KbCapability {
    search: Arc<dyn KbSearchService>,
    access: Arc<dyn KbAccess>,
    user_id: String,
    knowledge_base_ids: Vec<String>,
}

impl KbCapability {
    pub fn new(
        search: Arc<dyn KbSearchService>,
        access: Arc<dyn KbAccess>,
        user_id: &str,
        knowledge_base_ids: Vec<String>,
    ) -> Self {
        Self {
            search,
            access,
            user_id: user_id.to_string(),
            knowledge_base_ids,
        }
    }

    pub fn bound_knowledge_bases(&self) -> &[String] {
        &self.knowledge_base_ids
    }

    /// Validate field + operator for the entity, returning an error envelope
    /// on the first violation.
    fn validate(fields: &[(&str, FieldType)], field: &str, operator: &str) -> Option<Value> {
        let Some(field_type) = lookup_field(fields, field) else {
            return Some(error_envelope(
                "invalid_field",
                format!("Field '{field}' is not searchable."),
            ));
        };
        if !field_type.operators().contains(&operator) {
            return Some(error_envelope(
                "invalid_operator",
                format!("Operator '{operator}' is not valid for field '{field}'."),
            ));
        }
        None
    }

    /// Shared preflight: empty-binding short circuit, then RBAC.
    async fn preflight(&self) -> Option<Value> {
        if self.knowledge_base_ids.is_empty() {
            return Some(error_envelope(
                "no_knowledge_bases",
                "No knowledge bases are bound to this call.",
            ));
        }
        match self
            .access
            .check_read_access(&self.user_id, &self.knowledge_base_ids)
            .await
        {
            Ok(KbAccessDecision::Granted) => None,
            Ok(KbAccessDecision::Denied { knowledge_base_id }) => Some(error_envelope(
                "access_denied",
                format!("Access denied to knowledge base '{knowledge_base_id}'."),
            )),
            Ok(KbAccessDecision::UserNotFound) => {
                Some(error_envelope("user_not_found", "Executing user not found."))
            }
            Err(e) => Some(error_envelope("access_denied", e.to_string())),
        }
    }

    pub async fn search_chunks(
        &self,
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
    ) -> Value {
        if let Some(err) = Self::validate(CHUNK_FIELDS, field, operator) {
            return err;
        }
        if let Some(err) = self.preflight().await {
            return err;
        }
        let page = page.max(1);
        match self
            .search
            .search_chunks(
                &self.knowledge_base_ids,
                field,
                operator,
                value,
                page,
                PAGE_SIZE,
            )
            .await
        {
            Ok(results) => json!({
                "results": results.results,
                "total_results": results.total_results,
                "page": results.page,
                "page_size": results.page_size,
            }),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "chunk search failed");
                error_envelope("search_chunks_error", e.to_string())
            }
        }
    }

    pub async fn search_documents(
        &self,
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
    ) -> Value {
        if let Some(err) = Self::validate(DOCUMENT_FIELDS, field, operator) {
            return err;
        }
        if let Some(err) = self.preflight().await {
            return err;
        }
        let page = page.max(1);
        match self
            .search
            .search_documents(
                &self.knowledge_base_ids,
                field,
                operator,
                value,
                page,
                PAGE_SIZE,
            )
            .await
        {
            Ok(results) => json!({
                "results": results.results,
                "total_results": results.total_results,
                "page": results.page,
                "page_size": results.page_size,
            }),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "document search failed");
                error_envelope("search_documents_error", e.to_string())
            }
        }
    }

    /// Retrieve a single document, including content. A document outside the
    /// bound KB set is indistinguishable from a missing one.
    pub async fn get_document(&self, document_id: &str) -> Value {
        if let Some(err) = self.preflight().await {
            return err;
        }
        match self
            .search
            .get_document(&self.knowledge_base_ids, document_id)
            .await
        {
            Ok(Some(doc)) => json!({"status": "success", "document": doc}),
            Ok(None) => error_envelope("not_found", format!("Document '{document_id}' not found.")),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "get_document failed");
                error_envelope("get_document_error", e.to_string())
            }
        }
    }

    /// Ingest a document into one of the bound KBs.
    pub async fn upsert_document(&self, kb_id: &str, document: crate::traits::KbDocument) -> Value {
        if let Some(err) = self.preflight().await {
            return err;
        }
        if !self.knowledge_base_ids.iter().any(|id| id == kb_id) {
            return error_envelope(
                "access_denied",
                format!("Knowledge base '{kb_id}' is not bound to this call."),
            );
        }
        match self.search.upsert_document(kb_id, document).await {
            Ok(()) => json!({"status": "success"}),
            Err(e) => error_envelope("ingest_error", e.to_string()),
        }
    }
}
