pub mod dialect;
pub mod http;
pub mod mock;
pub mod normalizer;
pub mod sse;
pub mod tags;
pub mod tool_calls;

pub use dialect::{Decoded, Dialect, DialectDecoder};
pub use http::{HttpProvider, HttpTransport, CONNECT_TIMEOUT, SSE_IDLE_TIMEOUT};
pub use mock::{RecordedCall, ScriptedResponse, ScriptedTransport};
pub use normalizer::{NormalizerState, StreamNormalizer};
pub use sse::{parse_sse_text, SseEvent, SseFramer};
pub use tags::{Piece, PieceKind, TagSplitter, ThinkingTags};
pub use tool_calls::{parse_arguments, FinalizedCall, ToolCallAssembler};
