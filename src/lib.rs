//! Room membership and signaling relay for small peer-to-peer audio/video
//! meshes, plus the client-side session manager that negotiates one direct
//! session per pair of room occupants.

pub mod call;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod hub;
pub mod logging;
pub mod media;
pub mod relay;
pub mod room;
pub mod server;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use call::RoomCall;
pub use error::{Error, Result};
pub use hub::SignalingHub;
pub use server::SignalingServer;
pub use session::{SessionEvent, SessionManager};
