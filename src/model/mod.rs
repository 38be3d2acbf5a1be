pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{
    save_model_with_metadata, load_metadata, load_optimizer_binary, load_model_with_metadata,
    save_model, load_model, encode_optimizer_state, decode_optimizer_state, load_optimizer_state,
    print_metadata_info,
};
pub use inference_config::{InferenceConfig, Verdict, DEFAULT_CONFIDENCE_THRESHOLD};
pub use config::{AppConfig, EmojiClassifierConfig, ServerSettings, DEFAULT_EMOJI_CATEGORIES};
