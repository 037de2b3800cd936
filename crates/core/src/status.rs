//! Status helper enums mapping to SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table, and its label is the
//! wire name used in API responses and events.

use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID back into the enum.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Wire label, e.g. `"RUNNING"`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle of a single per-study extraction task.
    TaskStatus {
        Created = 1 => "CREATED",
        Queued = 2 => "QUEUED",
        Running = 3 => "RUNNING",
        Succeeded = 4 => "SUCCEEDED",
        Failed = 5 => "FAILED",
    }
}

impl TaskStatus {
    /// Statuses that count as "still in flight".
    pub const ACTIVE: [TaskStatus; 3] = [TaskStatus::Created, TaskStatus::Queued, TaskStatus::Running];

    /// `SUCCEEDED` and `FAILED` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `RUNNING -> RUNNING` is the progress update. `CREATED -> FAILED`
    /// covers submission failures and cancellation before dispatch,
    /// `QUEUED -> FAILED` covers cancellation before the executor starts.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Failed)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}
