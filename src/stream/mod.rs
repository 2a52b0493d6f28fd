pub mod boundary;
pub mod chunk;
pub mod chunks;
pub mod coordinator;
pub mod sse;

pub use boundary::{find_segment_boundary, BoundaryMatch};
pub use chunk::{ChunkKind, StreamChunk};
pub use chunks::{ChoiceContent, StreamChunks};
pub use coordinator::{CoordinatorSettings, StreamCoordinator, StreamStep};
pub use sse::{parse_sse_chunks, SseChunkParser};
