//! sblite daemon: the single binary wiring the engine and the realtime hub
//! to the Supabase-compatible HTTP/WebSocket surface.

pub mod auth;
pub mod realtime;
pub mod server;
pub mod telemetry;
