pub mod ml_model;
pub mod augment;
pub mod training;
pub mod classifier;
pub mod inference;

pub use ml_model::{
    EmojiCnn, ModelConfig, IMAGE_SIZE, feature_map_size,
    load_grayscale, decode_grayscale, grayscale_to_input, image_to_input,
};
pub use augment::{AugmentationConfig, augment};
pub use training::{ImageFolderDataset, ImageItem, EmojiBatcher, EmojiBatch, EmojiOptimizer, OptimizerState};
pub use classifier::{EmojiClassifier, EpochMetrics, Evaluation, Misclassification, Prediction, TrainingHistory};
pub use inference::InferenceEngine;
