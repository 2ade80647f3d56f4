//! Core of the acquisition and streaming runtime.
//!
//! Leaves first: path resolution, hashing, extraction and downloading; above
//! them the feedback bus, registry and acquisition orchestrator; on top the
//! task runner, module lifecycle and the streaming pipeline the concrete
//! modules share.

pub mod acquire;
pub mod buffer_pool;
pub mod download;
pub mod engine;
pub mod extract;
pub mod feedback;
pub mod metadata;
pub mod module;
pub mod modules;
pub mod paths;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod verify;

pub use acquire::ModelAcquirer;
pub use feedback::{FeedbackHandler, FeedbackReporter, ModelFeedback};
pub use metadata::{ModelMetadata, ModuleKind};
pub use module::{ModuleCore, ModuleState, SpeechModule};
pub use modules::{
    EnhancementModule, KeywordSpotterModule, OfflineRecognitionModule, RecognitionEvent,
    SpeechRecognitionModule, TtsModule, VadModule,
};
pub use pipeline::{PipelineConfig, PipelineEvent, VoicePipeline};
pub use registry::{global_registry, init_global_registry, reset_global_registry, ModelRegistry};
pub use runner::TaskRunner;
