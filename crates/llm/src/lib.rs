use std::sync::Arc;

mod packet;
mod provider;
mod rig_adapter;
mod scripted;

pub use packet::{ResponsePacket, answer_text};
pub use provider::{
    GenerationEvent, GenerationEventMapped, GenerationReply, GenerationRequest,
    GenerationService, GenerationTarget, GenerationToken, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigGenerationService};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptedGenerator, ScriptedReply};

pub fn create_service(mut config: ProviderConfig) -> ProviderResult<Arc<dyn GenerationService>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigGenerationService::new(config)?))
        }
        "scripted" | "echo" => Ok(Arc::new(ScriptedGenerator::new())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-service",
            provider_id: config.provider_id,
        }),
    }
}
