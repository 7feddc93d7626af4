//! Room server: authenticated project rooms over WebSocket.
//!
//! ## Overview
//!
//! Each project is a room. Members connect over `/ws`, publish messages that
//! are persisted to the room log and fanned out to everyone else in the room,
//! and may address the assistant with `@ai` to get a generated reply that is
//! delivered to the whole room.
//!
//! ## Module Map
//!
//! | Module       | Responsibility                                              |
//! |--------------|-------------------------------------------------------------|
//! | `db`         | SQLite access via `DbHandle` (projects, members, room logs) |
//! | `store`      | `MessageStore`: serialized appends, membership-checked reads |
//! | `locks`      | `RoomLocks`: one async mutex per room                       |
//! | `registry`   | `RoomRegistry`: live sessions per room, non-blocking fan-out |
//! | `gatekeeper` | `Gatekeeper`: room and credential checks before joining     |
//! | `router`     | `BroadcastRouter`: validate, persist, fan out, fork `@ai`   |
//! | `assistant`  | `TextGenerator` trait + `AssistantPipeline`                 |
//! | `ws`         | Upgrade handler and socket loop with ping/pong keepalive    |
//! | `api`        | HTTP history and collaborator routes, `AppState`            |
//! | `http`       | Router assembly and `start_server`                          |
//!
//! ## Publish Flow
//!
//! 1. `GET /ws?projectId=N` → `Gatekeeper::admit()`; a rejection is answered
//!    before the upgrade and the registry is never touched.
//! 2. The socket joins `RoomRegistry` with its own bounded outbox.
//! 3. A `room-message` frame → `BroadcastRouter::publish()`, which takes the
//!    room's sequencing lock, appends to `MessageStore` (failures are logged)
//!    and queues the frame for every other session in the room.
//! 4. If the body contains `@ai`, a detached task runs `AssistantPipeline`,
//!    then persists and delivers the reply to every session, sender included.

pub mod api;
pub mod assistant;
pub mod db;
pub mod gatekeeper;
pub mod http;
pub mod locks;
pub mod models;
pub mod registry;
pub mod router;
pub mod store;
pub mod ws;

pub use api::{AppState, SharedState};
pub use http::{build_router, build_state, open_database, serve, start_server};
