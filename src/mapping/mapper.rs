use super::CompiledResource;
use crate::entity::{Entity, RelationTarget};
use crate::error::SyncError;
use crate::expr::{EvalContext, Expr, ExprError};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Output of mapping one batch of raw records.
#[derive(Debug, Default)]
pub struct MappedBatch {
    pub entities: Vec<Entity>,
    /// Records rejected by the selector
    pub filtered: usize,
    /// Per-record failures; the batch continues past them
    pub errors: Vec<SyncError>,
}

impl MappedBatch {
    pub fn extend(&mut self, other: MappedBatch) {
        self.entities.extend(other.entities);
        self.filtered += other.filtered;
        self.errors.extend(other.errors);
    }
}

/// Turns raw records into candidate entities for one integration instance.
#[derive(Debug, Clone)]
pub struct EntityMapper {
    datasource: String,
    ctx: EvalContext,
}

impl EntityMapper {
    pub fn new(datasource: impl Into<String>, ctx: EvalContext) -> Self {
        Self {
            datasource: datasource.into(),
            ctx,
        }
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    /// Map one raw record.
    ///
    /// Returns `Ok(vec![])` when the selector rejects the record. With
    /// `itemsToParse` one record can produce several entities.
    pub fn map_record(
        &self,
        resource: &CompiledResource,
        record: &Value,
    ) -> Result<Vec<Entity>, SyncError> {
        let selected = resource
            .selector
            .eval_bool(record, &self.ctx)
            .map_err(|e| self.error(resource, record, "selector", e))?;
        if !selected {
            return Ok(Vec::new());
        }

        let Some(items_expr) = &resource.items_to_parse else {
            return Ok(vec![self.build(resource, record)?]);
        };

        let items = items_expr
            .eval_one(record, &self.ctx)
            .map_err(|e| self.error(resource, record, "itemsToParse", e))?;
        let items = match items {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(SyncError::Mapping {
                    kind: resource.kind.clone(),
                    record: record_label(record),
                    message: format!("itemsToParse must yield an array, got {}", other),
                })
            }
        };

        items
            .into_iter()
            .map(|item| {
                let mut scoped = record.clone();
                if let Value::Object(map) = &mut scoped {
                    map.insert("item".to_string(), item);
                } else {
                    scoped = serde_json::json!({ "item": item });
                }
                self.build(resource, &scoped)
            })
            .collect()
    }

    /// Map a batch, collecting per-record errors instead of failing.
    pub fn map_batch(&self, resource: &CompiledResource, records: &[Value]) -> MappedBatch {
        let mut batch = MappedBatch::default();
        for record in records {
            match self.map_record(resource, record) {
                Ok(entities) if entities.is_empty() => batch.filtered += 1,
                Ok(entities) => batch.entities.extend(entities),
                Err(e) => {
                    warn!(
                        kind = %resource.kind,
                        record = record_label(record).as_deref().unwrap_or("?"),
                        error = %e,
                        "Skipping record that failed to map"
                    );
                    batch.errors.push(e);
                }
            }
        }
        debug!(
            kind = %resource.kind,
            records = records.len(),
            entities = batch.entities.len(),
            filtered = batch.filtered,
            errors = batch.errors.len(),
            "Mapped batch"
        );
        batch
    }

    fn build(&self, resource: &CompiledResource, record: &Value) -> Result<Entity, SyncError> {
        let eval = |field: &str, expr: &Expr| {
            expr.eval_one(record, &self.ctx)
                .map_err(|e| self.error(resource, record, field, e))
        };
        let invalid = |message: String| SyncError::Mapping {
            kind: resource.kind.clone(),
            record: record_label(record),
            message,
        };

        let identifier = match eval("identifier", &resource.identifier)? {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(invalid(format!(
                    "identifier must be a non-empty string, got {}",
                    other
                )))
            }
        };

        let blueprint = match eval("blueprint", &resource.blueprint)? {
            Value::String(s) if !s.is_empty() => s,
            other => {
                return Err(invalid(format!(
                    "blueprint must be a non-empty string, got {}",
                    other
                )))
            }
        };

        let title = match &resource.title {
            Some(expr) => match eval("title", expr)? {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            },
            None => None,
        };

        let team = match &resource.team {
            Some(expr) => match eval("team", expr)? {
                Value::Null => None,
                other => Some(other),
            },
            None => None,
        };

        let mut properties = BTreeMap::new();
        for (name, expr) in &resource.properties {
            properties.insert(name.clone(), eval(&format!("properties.{name}"), expr)?);
        }

        let mut relations = BTreeMap::new();
        for (name, expr) in &resource.relations {
            let value = eval(&format!("relations.{name}"), expr)?;
            if let Some(target) = relation_target(value).map_err(|m| {
                invalid(format!("relation '{}': {}", name, m))
            })? {
                relations.insert(name.clone(), target);
            }
        }

        Ok(Entity {
            identifier,
            title,
            blueprint,
            team,
            properties,
            relations,
            datasource: Some(self.datasource.clone()),
        })
    }

    fn error(
        &self,
        resource: &CompiledResource,
        record: &Value,
        field: &str,
        e: ExprError,
    ) -> SyncError {
        SyncError::Mapping {
            kind: resource.kind.clone(),
            record: record_label(record),
            message: format!("{}: {}", field, e),
        }
    }
}

/// string → one target, array of strings → many, null → no relation.
fn relation_target(value: Value) -> Result<Option<RelationTarget>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(RelationTarget::One(s))),
        Value::Number(n) => Ok(Some(RelationTarget::One(n.to_string()))),
        Value::Array(items) => items
            .into_iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(format!("expected identifiers, got {}", other)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|ids| Some(RelationTarget::Many(ids))),
        other => Err(format!("expected identifier or array, got {}", other)),
    }
}

/// Best-effort record label for logs: `id`, `identifier`, `key` or `name`.
fn record_label(record: &Value) -> Option<String> {
    ["id", "identifier", "key", "name", "number"]
        .iter()
        .find_map(|k| record.get(*k))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
