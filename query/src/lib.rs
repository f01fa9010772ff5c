pub mod llm;
pub mod orchestrator;
pub mod rag;
pub mod retriever;

pub use llm::{build_llm_client, GenerationParams, LlmClient, LlmConfig, LlmError};
pub use orchestrator::{ModelInfo, QueryError, QueryOrchestrator, QueryResult};
pub use rag::{Answer, RagError, RagOrchestrator};
pub use retriever::{
    build_retriever, Hit, ParamMode, RetrievalContext, Retriever, RetrieverError, RetrieverUsage,
};
