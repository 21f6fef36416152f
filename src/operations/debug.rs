use crate::context::{Context, Emit};
use crate::pipeline::Operation;
use crate::{Data, Result};
use async_trait::async_trait;

/// Logs the item and passes it on if a `pass` handler exists
pub struct Inspect;

#[async_trait]
impl Operation for Inspect {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        let pretty = serde_json::to_string_pretty(&data)?;
        tracing::info!("Inspect data:\n{}", pretty);
        ctx.emit_with(Emit::new(data).optional())
    }
}
