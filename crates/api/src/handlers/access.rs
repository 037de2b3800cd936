//! Lookup helpers that enforce ownership.
//!
//! Missing records map to 404, records owned by someone else to 403.

use quantimage_core::error::CoreError;
use quantimage_core::extraction::{Extraction, ExtractionTask};
use quantimage_core::job_events::Topic;
use quantimage_core::types::DbId;
use quantimage_pipeline::ExtractionContext;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;

/// Fetch an extraction and verify the caller owns it.
pub async fn find_owned_extraction(
    ctx: &ExtractionContext,
    id: DbId,
    auth: &AuthUser,
) -> AppResult<Extraction> {
    let extraction = ctx
        .extractions
        .find(id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Extraction",
            id,
        }))?;
    auth.ensure_owns(&extraction.owner, "extraction")?;
    Ok(extraction)
}

/// Fetch a task, with its current state from the state reader, and
/// verify the caller owns its extraction.
pub async fn find_owned_task(
    ctx: &ExtractionContext,
    id: DbId,
    auth: &AuthUser,
) -> AppResult<(ExtractionTask, Extraction)> {
    let mut task = ctx
        .extractions
        .find_task(id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Task", id }))?;
    let extraction = find_owned_extraction(ctx, task.extraction_id, auth).await?;

    if let Some(state) = ctx.reader.get(id).await? {
        task.state = state;
    }
    Ok((task, extraction))
}

/// Verify the caller may subscribe to `topic`.
pub async fn authorize_topic(
    ctx: &ExtractionContext,
    topic: Topic,
    auth: &AuthUser,
) -> AppResult<()> {
    match topic {
        Topic::Job(id) => find_owned_extraction(ctx, id, auth).await.map(|_| ()),
        Topic::Task(id) => {
            let task = ctx
                .extractions
                .find_task(id)
                .await?
                .ok_or(AppError::Core(CoreError::NotFound { entity: "Task", id }))?;
            find_owned_extraction(ctx, task.extraction_id, auth)
                .await
                .map(|_| ())
        }
    }
}
