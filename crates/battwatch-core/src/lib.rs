//! Client-side data-synchronization engine for the Battwatch panel.
//!
//! This crate owns the state-machine logic between the websocket command
//! channel (`battwatch-api`) and whatever renders the device list:
//!
//! - **[`SyncEngine`]** — Facade managing the full lifecycle:
//!   [`attach()`](SyncEngine::attach) restores durable state, fetches the
//!   first page, subscribes to live updates, and spawns the event pump;
//!   operations cover pagination, sorting, filter editing, and
//!   preference saves. Output is reactive `tokio::sync::watch` snapshots.
//!
//! - **[`ConnectionState`]** / connection supervisor — Connected /
//!   Reconnecting / Offline with capped exponential backoff
//!   (1, 2, 4, 8, 16, 30s; ten attempts, then terminal until a manual
//!   refresh).
//!
//! - **[`MessageRouter`]** — explicit observer registry over the push
//!   stream, installed at most once per transport so reconnects never
//!   double-deliver events.
//!
//! - **[`DevicePager`]** — cursor pagination with an in-flight guard:
//!   at most one outstanding fetch, appends in issue order, wholesale
//!   replace on query changes.
//!
//! - **`FilterCoalescer`** — debounces filter toggles into single
//!   queries and backs the stage/commit/discard editing flow.
//!
//! - **Domain model** ([`model`]) — `DeviceRecord`, `BatteryStatus`,
//!   `FilterSet`, sort keys, preferences, and the durable `PanelState`.

pub mod coalescer;
pub mod config;
pub mod connection;
pub mod convert;
pub mod engine;
pub mod error;
pub mod model;
pub mod pages;
pub mod persist;
pub mod router;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::EngineConfig;
pub use connection::{ConnectionState, ReconnectPolicy};
pub use engine::SyncEngine;
pub use error::CoreError;
pub use pages::DevicePager;
pub use persist::StateSink;
pub use router::MessageRouter;
pub use subscription::SubscriptionClient;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    AreaOption,
    BatteryStatus,
    DeviceQuery,
    DeviceRecord,
    FilterCategory,
    FilterOptions,
    FilterSet,
    NotificationEntry,
    NotificationPrefs,
    PanelState,
    SeverityFilter,
    SortKey,
    SortOrder,
    StatusCounts,
    ThresholdPrefs,
};
