// ClawLink Gateway Client
//
// Client side of the OpenClaw gateway WebSocket protocol: device identity,
// device tokens, the signed connect handshake and request/response calls.

pub mod auth;
pub mod client;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod transport;

pub use auth::{AuthStoreError, DeviceAuthPayload, DeviceAuthStore, DeviceAuthToken};
pub use client::{ClientError, ClientOptions, ConnectionState, GatewayClient};
pub use events::{EventHandler, EventSubscribers, SubscriptionId, ANY_EVENT};
pub use identity::{derive_device_id, fingerprint, DeviceIdentity, IdentityError};
pub use protocol::*;
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};
