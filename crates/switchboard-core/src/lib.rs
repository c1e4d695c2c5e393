pub mod account;
pub mod context;
pub mod errors;
pub mod ids;
pub mod security;
pub mod stream;
pub mod tokens;
pub mod transport;

pub use account::{Account, AccountStatus};
pub use context::{ChatMessage, RequestContext, Role, ToolDefinition};
pub use errors::{GatewayError, QuotaKind, TransportKind};
pub use ids::{AccountId, RequestId, SegmentId, ToolCallId};
pub use security::Credentials;
pub use stream::{ChunkDelta, FinishReason, ResponseEvent, ToolCallFragment};
pub use tokens::{clamp_count, Usage};
pub use transport::{ChunkStream, Endpoint, Transport};
