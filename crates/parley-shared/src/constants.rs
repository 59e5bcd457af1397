/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Ed25519 public key size in bytes.
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Rendezvous topic size in bytes.
pub const TOPIC_SIZE: usize = 32;

/// Key derivation context for one-time rendezvous topics (BLAKE3).
pub const KDF_CONTEXT_ROOM_TOPIC: &str = "parley-room-topic-v1";

/// Capacity of the per-session and per-registry broadcast event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Metadata key holding the local participant's encoded writer key.
pub const META_WHO: &str = "who";

/// Metadata key holding the host's encoded writer key on joined rooms.
pub const META_HOST: &str = "host";
