//! Row model for the `extractions` table.

use quantimage_core::error::CoreError;
use quantimage_core::extraction::{Extraction, ExtractionScope, FeatureConfig};
use quantimage_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `extractions` table.
#[derive(Debug, Clone, FromRow)]
pub struct ExtractionRow {
    pub id: DbId,
    pub owner: String,
    pub scope_kind: String,
    pub scope_ref: String,
    pub config: serde_json::Value,
    pub finalized_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl TryFrom<ExtractionRow> for Extraction {
    type Error = CoreError;

    fn try_from(row: ExtractionRow) -> Result<Self, Self::Error> {
        let scope = ExtractionScope::from_parts(&row.scope_kind, &row.scope_ref)?;
        let config: FeatureConfig = serde_json::from_value(row.config).map_err(|e| {
            CoreError::Internal(format!("Stored config of extraction {} is invalid: {e}", row.id))
        })?;
        Ok(Extraction {
            id: row.id,
            owner: row.owner,
            scope,
            config,
            created_at: row.created_at,
            finalized_at: row.finalized_at,
        })
    }
}
