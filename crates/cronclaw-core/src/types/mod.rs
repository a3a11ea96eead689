//! Data model: tasks, runs and their policy enums.

/// Declares a unit enum stored as an upper-case string (`"CANCEL_PREV"`),
/// with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::CronClawError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::CronClawError::InvalidArgument(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

pub mod filter;
pub mod run;
pub mod task;

pub use filter::{RunFilter, RunTimeField, TaskFilter};
pub use run::{
    LatencyStats, NewRun, Run, RunSnapshot, RunStats, RunStatus, RunTransition, StatusCount,
    TaskRunCount,
};
pub use task::{
    ConcurrencyPolicy, ExecType, FailureAction, MisfirePolicy, OverlapAction, Task, TaskStatus,
};
