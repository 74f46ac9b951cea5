//! Bulk operations: post/patch/delete many records through the normal
//! executor path, atomically (single transaction, first failure rolls
//! back) or per-item (failures collected into a result envelope).

use serde_json::{json, Value};

use crate::error::ApiError;
use crate::executor::{Credentials, Engine, EngineResponse, Request};

impl Engine {
    /// Insert many records. Each item is a JSON:API `data` object.
    pub async fn bulk_post(
        &self,
        resource: &str,
        records: Vec<Value>,
        atomic: bool,
        credentials: Credentials,
    ) -> Result<EngineResponse, ApiError> {
        let resource = resource.to_string();
        self.bulk_run(records, atomic, credentials, move |item| {
            Request::post(resource.clone(), json!({ "data": item }))
        })
        .await
    }

    /// Update many records. Each item is a JSON:API `data` object carrying
    /// the target id.
    pub async fn bulk_patch(
        &self,
        resource: &str,
        ops: Vec<Value>,
        atomic: bool,
        credentials: Credentials,
    ) -> Result<EngineResponse, ApiError> {
        let resource = resource.to_string();
        self.bulk_run(ops, atomic, credentials, move |item| {
            let id = item
                .get("id")
                .map(scalar_id)
                .unwrap_or_default();
            Request::patch(resource.clone(), id, json!({ "data": item }))
        })
        .await
    }

    /// Delete many records by id.
    pub async fn bulk_delete(
        &self,
        resource: &str,
        ids: Vec<String>,
        atomic: bool,
        credentials: Credentials,
    ) -> Result<EngineResponse, ApiError> {
        let resource = resource.to_string();
        let items: Vec<Value> = ids.into_iter().map(Value::String).collect();
        self.bulk_run(items, atomic, credentials, move |item| {
            Request::delete(resource.clone(), scalar_id(&item))
        })
        .await
    }

    async fn bulk_run<F>(
        &self,
        items: Vec<Value>,
        atomic: bool,
        credentials: Credentials,
        make_request: F,
    ) -> Result<EngineResponse, ApiError>
    where
        F: Fn(Value) -> Request,
    {
        let max = self.config().bulk_max_items;
        if items.len() > max {
            return Err(ApiError::violation(
                "data",
                "max_items",
                format!("Bulk operations accept at most {max} items"),
            ));
        }

        // Resolve credentials once; items reuse the context.
        let auth = self.authenticate_credentials(&credentials).await?;
        let total = items.len();
        let indexed: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
        let chunk_size = self.config().bulk_chunk_size.max(1);

        if atomic {
            let tx = self.begin().await?;
            let mut data = Vec::with_capacity(total);
            for chunk in indexed.chunks(chunk_size) {
                for (_, item) in chunk {
                    let request = make_request(item.clone())
                        .with_auth(auth.clone())
                        .in_transaction(tx);
                    match self.execute(request).await {
                        Ok(response) => data.push(primary_data(response)),
                        Err(err) => {
                            // First failure rolls the whole batch back.
                            let _ = self.rollback(tx).await;
                            return Err(err);
                        }
                    }
                }
            }
            if let Err(err) = self.commit(tx).await {
                return Err(err);
            }
            Ok(EngineResponse::ok(json!({
                "data": data,
                "meta": { "total": total, "succeeded": total, "failed": 0 },
            })))
        } else {
            let mut data = Vec::new();
            let mut errors = Vec::new();
            for chunk in indexed.chunks(chunk_size) {
                for (index, item) in chunk {
                    let request = make_request(item.clone()).with_auth(auth.clone());
                    match self.execute(request).await {
                        Ok(response) => data.push(primary_data(response)),
                        Err(err) => errors.push(json!({
                            "index": index,
                            "error": {
                                "status": err.status().as_u16().to_string(),
                                "code": err.code(),
                                "detail": err.to_string(),
                            },
                        })),
                    }
                }
            }
            let failed = errors.len();
            Ok(EngineResponse::ok(json!({
                "data": data,
                "errors": errors,
                "meta": { "total": total, "succeeded": total - failed, "failed": failed },
            })))
        }
    }
}

fn primary_data(response: EngineResponse) -> Value {
    response
        .document
        .and_then(|doc| doc.get("data").cloned())
        .unwrap_or(Value::Null)
}

fn scalar_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
