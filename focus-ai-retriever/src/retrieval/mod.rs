pub mod analyzer;
pub mod capability_router;
pub mod chunking_strategy;
pub mod context_assembler;
pub mod indexing_engine;
pub mod task_queue;
pub mod vector_index;
