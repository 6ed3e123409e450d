use super::context::TaskContext;
use async_trait::async_trait;

/// A leaf action run over a set of nodes.
///
/// `run` returns `Ok(true)` when the nodes it did not raise all succeeded,
/// `Ok(false)` when they all failed. An `Err` is treated like `Ok(false)` with
/// the error kept as the failure reason. Nodes needing a different outcome
/// than the rest are raised through [`TaskContext::raiser`] before returning.
#[async_trait]
pub trait Microstep: Send + Sync {
    /// Name leaves use to reference this microstep
    fn name(&self) -> &str;

    /// Run the step over `ctx.nodes()`
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<bool>;

    /// Check the arguments of a leaf when the workflow is built
    fn validate_args(&self, _args: &[serde_json::Value]) -> anyhow::Result<()> {
        Ok(())
    }
}
