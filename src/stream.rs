//! Stream ingestion: fragment classification and flow item building

pub mod builder;
pub mod parser;

pub use builder::{apply_chunk, BuildError, ChunkOutcome};
pub use parser::{parse_fragment, ParseError, ParsedChunk, StreamFragment};
