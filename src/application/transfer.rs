use super::context::{Orchestration, OrchestrationContext};
use crate::domain::entity::EntityId;
use crate::domain::orchestration::{TransferRequest, TransferResult};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Moves a booking from one room to another under a lock over both rooms.
pub struct TransferOrchestration;

#[async_trait]
impl Orchestration for TransferOrchestration {
    fn name(&self) -> &'static str {
        "change_booked_room"
    }

    async fn run(
        &self,
        ctx: &mut OrchestrationContext,
        input: &TransferRequest,
    ) -> Result<TransferResult> {
        if !ctx.is_replaying() {
            info!(
                instance = %ctx.instance_id(),
                from_room = %input.from_room,
                to_room = %input.to_room,
                "Starting room booking change"
            );
        }

        let from = input.from_entity();
        let to = input.to_entity();

        let lock = ctx.lock(&[from.clone(), to.clone()]).await?;
        // On error the engine releases whatever this instance still holds.
        let result = move_booking(ctx, &from, &to).await?;
        ctx.release(lock).await?;

        Ok(result)
    }
}

async fn move_booking(
    ctx: &mut OrchestrationContext,
    from: &EntityId,
    to: &EntityId,
) -> Result<TransferResult> {
    // Guard reads the source room's flag, not the destination's.
    // Open question, see DESIGN.md.
    if ctx.entity(from).is_currently_booked().await? {
        return Ok(TransferResult::already_booked());
    }

    ctx.entity(from).unbook().await?;
    ctx.entity(to).book().await?;

    Ok(TransferResult::booked())
}
