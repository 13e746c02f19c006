//! Applies human approve/reject decisions to waiting operations.

use super::catalog::targets_overlap;
use super::{all_concluded, run_claimed, Catalog, Operation, OperationContext, OperationStatus};
use crate::chat::{ChatMessage, ChatStore};
use crate::error::StoreError;
use crate::handlers::HandlerRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What one resolution call did, by operation index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub executed: Vec<usize>,
    pub rejected: Vec<usize>,
    /// Indices that were out of range or not in a resolvable state.
    pub ignored: Vec<usize>,
    /// Every operation of the message is now done, rejected or failed.
    pub all_terminal: bool,
}

pub struct ApprovalResolver<'a> {
    catalog: &'a Catalog,
    handlers: &'a HandlerRegistry,
}

impl<'a> ApprovalResolver<'a> {
    pub fn new(catalog: &'a Catalog, handlers: &'a HandlerRegistry) -> Self {
        Self { catalog, handlers }
    }

    /// Resolve a stored message.
    ///
    /// Approved operations are claimed (`doing`) and committed before any
    /// handler runs, and their results are written back in a second
    /// transaction. A stored `doing` operation is never approvable again, so
    /// a concurrent approval or a crash mid-handler cannot run it twice.
    pub async fn resolve_stored(
        &self,
        store: &ChatStore,
        chat_id: &str,
        created: u64,
        approved: &[usize],
        rejected: &[usize],
        ctx: &OperationContext,
    ) -> Result<Resolution, StoreError> {
        let (mut resolution, mut claimed) = {
            let mut tx = store.transaction(chat_id).await?;
            let message = tx
                .data_mut()
                .message_mut(created)
                .ok_or(StoreError::MessageNotFound(created))?;
            let Some(operations) = message.operations.as_mut() else {
                return Ok(nothing_to_resolve(created, approved, rejected));
            };
            let (resolution, claimed) = self.claim(operations, approved, rejected);
            let claimed: Vec<(usize, Operation)> = claimed
                .into_iter()
                .map(|idx| (idx, operations[idx].clone()))
                .collect();
            tx.commit()?;
            (resolution, claimed)
        };

        for (_, operation) in claimed.iter_mut() {
            run_claimed(operation, self.handlers, ctx).await;
        }

        let mut tx = store.transaction(chat_id).await?;
        let message = tx
            .data_mut()
            .message_mut(created)
            .ok_or(StoreError::MessageNotFound(created))?;
        let operations = message.operations.get_or_insert_with(Vec::new);
        for (idx, operation) in claimed {
            match operations.get_mut(idx) {
                Some(stored) if stored.status == OperationStatus::Doing => *stored = operation,
                _ => tracing::warn!(index = idx, "claimed operation changed while it ran"),
            }
        }
        self.promote_unblocked(operations);
        resolution.all_terminal = all_concluded(operations);
        tx.commit()?;
        Ok(resolution)
    }

    pub async fn resolve_message(
        &self,
        message: &mut ChatMessage,
        approved: &[usize],
        rejected: &[usize],
        ctx: &OperationContext,
    ) -> Resolution {
        match message.operations.as_mut() {
            Some(operations) => self.resolve(operations, approved, rejected, ctx).await,
            None => nothing_to_resolve(message.created, approved, rejected),
        }
    }

    /// Rejections are applied first, so an index in both lists is rejected.
    /// Approvals run in ascending index order; each one may unblock later
    /// siblings before they are considered.
    pub async fn resolve(
        &self,
        operations: &mut [Operation],
        approved: &[usize],
        rejected: &[usize],
        ctx: &OperationContext,
    ) -> Resolution {
        let (mut resolution, claimed) = self.claim(operations, approved, rejected);
        for idx in claimed {
            run_claimed(&mut operations[idx], self.handlers, ctx).await;
        }
        self.promote_unblocked(operations);
        resolution.all_terminal = all_concluded(operations);
        resolution
    }

    /// Apply rejections and move approvable operations to `doing`.
    ///
    /// Returns the claimed indices in execution order; `executed` already
    /// lists them. No handler runs here.
    fn claim(
        &self,
        operations: &mut [Operation],
        approved: &[usize],
        rejected: &[usize],
    ) -> (Resolution, Vec<usize>) {
        let mut resolution = Resolution::default();
        let rejected: BTreeSet<usize> = rejected.iter().copied().collect();
        let approved: BTreeSet<usize> = approved
            .iter()
            .copied()
            .filter(|idx| !rejected.contains(idx))
            .collect();

        for idx in rejected {
            match operations.get_mut(idx) {
                Some(op) => {
                    if op.reject() {
                        resolution.rejected.push(idx);
                    } else {
                        tracing::warn!(index = idx, status = %op.status, "cannot reject operation in this state");
                        resolution.ignored.push(idx);
                    }
                }
                None => {
                    tracing::warn!(index = idx, "reject index out of range");
                    resolution.ignored.push(idx);
                }
            }
        }
        self.promote_unblocked(operations);

        let mut claimed = Vec::new();
        for idx in approved {
            let Some(op) = operations.get_mut(idx) else {
                tracing::warn!(index = idx, "approve index out of range");
                resolution.ignored.push(idx);
                continue;
            };
            if op.status != OperationStatus::Analyzed || !op.begin() {
                tracing::warn!(index = idx, status = %op.status, "cannot approve operation in this state");
                resolution.ignored.push(idx);
                continue;
            }
            claimed.push(idx);
            self.promote_unblocked(operations);
        }

        resolution.executed = claimed.clone();
        resolution.ignored.sort_unstable();
        resolution.all_terminal = all_concluded(operations);
        (resolution, claimed)
    }

    /// Move `analyzedBlocked` operations whose earlier overlapping siblings
    /// are all claimed or concluded back to `analyzed`.
    fn promote_unblocked(&self, operations: &mut [Operation]) {
        for idx in 0..operations.len() {
            if operations[idx].status != OperationStatus::AnalyzedBlocked {
                continue;
            }
            let target = self
                .catalog
                .target(&operations[idx].op_type, &operations[idx].input);
            let still_blocked = target.is_some_and(|target| {
                operations[..idx].iter().any(|earlier| {
                    earlier.status.is_pending()
                        && self
                            .catalog
                            .target(&earlier.op_type, &earlier.input)
                            .is_some_and(|other| targets_overlap(&target, &other))
                })
            });
            if !still_blocked {
                tracing::debug!(index = idx, "operation unblocked");
                operations[idx].status = OperationStatus::Analyzed;
            }
        }
    }
}

fn nothing_to_resolve(created: u64, approved: &[usize], rejected: &[usize]) -> Resolution {
    tracing::warn!(created, "message has no operations to resolve");
    let mut ignored: Vec<usize> = approved.iter().chain(rejected).copied().collect();
    ignored.sort_unstable();
    ignored.dedup();
    Resolution {
        ignored,
        all_terminal: true,
        ..Resolution::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Environment;
    use crate::operation::{ChatMode, OperationManager, OperationRequest};
    use crate::testsupport::TestTempDir;
    use serde_json::json;

    fn context(dir: &TestTempDir, mode: ChatMode) -> OperationContext {
        OperationContext {
            chat_id: "chat".to_string(),
            mode,
            env: Environment::in_memory(dir.path()),
            max_message_chars: 2_000,
        }
    }

    async fn waiting_operations(
        catalog: &Catalog,
        handlers: &HandlerRegistry,
        ctx: &OperationContext,
        requests: Vec<OperationRequest>,
    ) -> Vec<Operation> {
        let mut manager = OperationManager::new(catalog, handlers, ctx.clone());
        for request in requests {
            manager.handle(request).await;
        }
        manager.into_operations()
    }

    fn write(path: &str, content: &str) -> OperationRequest {
        OperationRequest::new("file_write", json!({"path": path, "content": content}))
    }

    #[tokio::test]
    async fn approve_executes_and_reject_wins_over_approve() {
        let dir = TestTempDir::new("resolver-basic");
        let catalog = Catalog::builtin();
        let handlers = HandlerRegistry::builtin();
        let ctx = context(&dir, ChatMode::None);
        let mut ops = waiting_operations(
            &catalog,
            &handlers,
            &ctx,
            vec![write("a.txt", "a"), write("b.txt", "b")],
        )
        .await;

        let resolver = ApprovalResolver::new(&catalog, &handlers);
        let resolution = resolver.resolve(&mut ops, &[0, 1], &[1], &ctx).await;

        assert_eq!(resolution.executed, vec![0]);
        assert_eq!(resolution.rejected, vec![1]);
        assert!(resolution.ignored.is_empty());
        assert!(resolution.all_terminal);
        assert_eq!(ops[0].status, OperationStatus::Done);
        assert_eq!(ops[1].status, OperationStatus::Rejected);
        assert!(dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn second_approval_is_ignored() {
        let dir = TestTempDir::new("resolver-twice");
        let catalog = Catalog::builtin();
        let handlers = HandlerRegistry::builtin();
        let ctx = context(&dir, ChatMode::None);
        let mut ops = waiting_operations(&catalog, &handlers, &ctx, vec![write("a.txt", "a")]).await;

        let resolver = ApprovalResolver::new(&catalog, &handlers);
        let first = resolver.resolve(&mut ops, &[0], &[], &ctx).await;
        assert_eq!(first.executed, vec![0]);

        std::fs::write(dir.path().join("a.txt"), "changed").expect("overwrite");
        let second = resolver.resolve(&mut ops, &[0, 7], &[0], &ctx).await;
        assert!(second.executed.is_empty());
        assert_eq!(second.ignored, vec![0, 7]);
        assert_eq!(ops[0].status, OperationStatus::Done);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).expect("read"),
            "changed"
        );
    }

    #[tokio::test]
    async fn blocked_operation_unblocks_after_its_blocker_runs() {
        let dir = TestTempDir::new("resolver-blocked");
        let catalog = Catalog::builtin();
        let handlers = HandlerRegistry::builtin();
        let ctx = context(&dir, ChatMode::None);
        let mut ops = waiting_operations(
            &catalog,
            &handlers,
            &ctx,
            vec![write("a.txt", "first"), write("a.txt", "second")],
        )
        .await;
        assert_eq!(ops[1].status, OperationStatus::AnalyzedBlocked);

        let resolver = ApprovalResolver::new(&catalog, &handlers);
        let only_blocked = resolver.resolve(&mut ops, &[1], &[], &ctx).await;
        assert_eq!(only_blocked.ignored, vec![1]);
        assert!(!dir.path().join("a.txt").exists());

        let both = resolver.resolve(&mut ops, &[0, 1], &[], &ctx).await;
        assert_eq!(both.executed, vec![0, 1]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).expect("read"),
            "second"
        );
    }

    #[tokio::test]
    async fn rejecting_blocker_promotes_dependent() {
        let dir = TestTempDir::new("resolver-promote");
        let catalog = Catalog::builtin();
        let handlers = HandlerRegistry::builtin();
        let ctx = context(&dir, ChatMode::None);
        let mut ops = waiting_operations(
            &catalog,
            &handlers,
            &ctx,
            vec![write("a.txt", "first"), write("a.txt", "second")],
        )
        .await;

        let resolver = ApprovalResolver::new(&catalog, &handlers);
        let resolution = resolver.resolve(&mut ops, &[], &[0], &ctx).await;
        assert_eq!(resolution.rejected, vec![0]);
        assert!(!resolution.all_terminal);
        assert_eq!(ops[1].status, OperationStatus::Analyzed);
    }
}
