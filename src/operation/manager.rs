//! Per-turn operation manager.
//!
//! Created for one model turn and consumed by [`OperationManager::into_operations`]
//! once the model stops emitting tool calls, which freezes the list.

use super::catalog::targets_overlap;
use super::{
    execute_operation, policy, Catalog, Operation, OperationContext, OperationRequest,
    OperationStatus, OperationSummary,
};
use crate::error::OperationError;
use crate::handlers::HandlerRegistry;
use serde_json::Value;

pub struct OperationManager<'a> {
    catalog: &'a Catalog,
    handlers: &'a HandlerRegistry,
    ctx: OperationContext,
    operations: Vec<Operation>,
}

impl<'a> OperationManager<'a> {
    pub fn new(catalog: &'a Catalog, handlers: &'a HandlerRegistry, ctx: OperationContext) -> Self {
        Self {
            catalog,
            handlers,
            ctx,
            operations: Vec::new(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary::from_operations(&self.operations)
    }

    /// Freeze the turn's list. No operation can be added afterwards.
    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// Re-enter execution for the operation at `index`.
    ///
    /// Goes through the same single-execution guard as `handle`: returns
    /// false, without calling the handler, for anything not claimable.
    pub async fn execute(&mut self, index: usize) -> bool {
        let Some(operation) = self.operations.get_mut(index) else {
            tracing::warn!(index, "execute index out of range");
            return false;
        };
        execute_operation(operation, self.handlers, &self.ctx).await
    }

    /// Classify, validate and then either execute or park one request.
    ///
    /// The returned operation is in `done`/`failed` when it ran (or failed
    /// validation) and in `analyzed`/`analyzedBlocked` when it needs approval.
    pub async fn handle(&mut self, request: OperationRequest) -> &Operation {
        let kind = self
            .catalog
            .classify(&request.op_type, &request.input, &self.ctx);
        let mut operation = Operation::new(request, kind);

        if let Err(err) = self.validate(&operation) {
            tracing::debug!(op_type = %operation.op_type, error = %err, "operation rejected at validation");
            operation.fail(err.to_string());
            return self.push(operation);
        }

        if policy::authorize(self.ctx.mode, kind) {
            execute_operation(&mut operation, self.handlers, &self.ctx).await;
            return self.push(operation);
        }

        operation.analysis = Some(self.analyze(&operation).await);
        operation.status = if self.blocked_by_sibling(&operation) {
            OperationStatus::AnalyzedBlocked
        } else {
            OperationStatus::Analyzed
        };
        tracing::debug!(
            op_type = %operation.op_type,
            kind = %kind,
            status = %operation.status,
            mode = %self.ctx.mode,
            "operation awaits approval"
        );
        self.push(operation)
    }

    fn push(&mut self, operation: Operation) -> &Operation {
        self.operations.push(operation);
        let idx = self.operations.len() - 1;
        &self.operations[idx]
    }

    fn validate(&self, operation: &Operation) -> Result<(), OperationError> {
        if !matches!(operation.input, Value::Object(_)) {
            return Err(OperationError::InvalidInput(
                "operation input must be a JSON object".to_string(),
            ));
        }
        let handler = self
            .handlers
            .get(&operation.op_type)
            .ok_or_else(|| OperationError::UnknownKind(operation.op_type.clone()))?;
        handler.validate(&operation.input)
    }

    async fn analyze(&self, operation: &Operation) -> String {
        let fallback = || {
            self.catalog
                .description(&operation.op_type)
                .unwrap_or("unrecognized operation")
                .to_string()
        };
        let Some(handler) = self.handlers.get(&operation.op_type) else {
            return fallback();
        };
        match handler.analyze(&operation.input, &self.ctx).await {
            Ok(analysis) => analysis,
            Err(err) => {
                tracing::debug!(op_type = %operation.op_type, error = %err, "analysis failed");
                fallback()
            }
        }
    }

    /// An operation is blocked when an earlier sibling that is still waiting
    /// touches an overlapping resource.
    fn blocked_by_sibling(&self, operation: &Operation) -> bool {
        let Some(target) = self.catalog.target(&operation.op_type, &operation.input) else {
            return false;
        };
        self.operations.iter().any(|earlier| {
            earlier.status.is_pending()
                && self
                    .catalog
                    .target(&earlier.op_type, &earlier.input)
                    .is_some_and(|other| targets_overlap(&target, &other))
        })
    }
}
