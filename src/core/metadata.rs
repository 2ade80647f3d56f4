//! Model metadata records served by the registry.

use serde::{Deserialize, Serialize};

/// Category of speech task a model belongs to.
///
/// Determines the on-disk directory layout and which native capability set a
/// module binds. Kinds without a concrete module binding still resolve paths
/// and acquire normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    SpeechRecognition,
    SpeechSynthesis,
    VoiceActivityDetection,
    KeywordSpotting,
    SpeechEnhancement,
    SpeakerIdentification,
    SpeakerDiarization,
    SpeakerVerification,
    AudioTagging,
    AddPunctuation,
    SourceSeparation,
    SpokenLanguageIdentification,
}

impl ModuleKind {
    /// Kebab-cased directory name under the models root.
    pub fn as_dir_name(&self) -> &'static str {
        match self {
            ModuleKind::SpeechRecognition => "speech-recognition",
            ModuleKind::SpeechSynthesis => "speech-synthesis",
            ModuleKind::VoiceActivityDetection => "voice-activity-detection",
            ModuleKind::KeywordSpotting => "keyword-spotting",
            ModuleKind::SpeechEnhancement => "speech-enhancement",
            ModuleKind::SpeakerIdentification => "speaker-identification",
            ModuleKind::SpeakerDiarization => "speaker-diarization",
            ModuleKind::SpeakerVerification => "speaker-verification",
            ModuleKind::AudioTagging => "audio-tagging",
            ModuleKind::AddPunctuation => "add-punctuation",
            ModuleKind::SourceSeparation => "source-separation",
            ModuleKind::SpokenLanguageIdentification => "spoken-language-identification",
        }
    }
}

/// Everything needed to fetch and verify one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Unique identifier within the module kind.
    #[serde(rename = "modelId")]
    pub model_id: String,

    #[serde(rename = "moduleType")]
    pub module_kind: ModuleKind,

    /// Absolute URL of the model archive or single file.
    #[serde(rename = "downloadUrl")]
    pub download_url: String,

    /// Expected SHA-256 of the downloaded artifact, if known.
    #[serde(rename = "downloadFileHash", default)]
    pub download_file_hash: Option<String>,

    /// Logical file names relative to the model directory; the registry
    /// rewrites these to absolute paths on first lookup.
    #[serde(rename = "modelFileNames", default)]
    pub model_file_names: Vec<String>,

    /// SHA-256 per model file, index-aligned with `model_file_names`.
    /// Either empty or the same length as the name list.
    #[serde(rename = "modelFileHashes", default)]
    pub model_file_hashes: Vec<String>,
}

impl ModelMetadata {
    /// Expected hash for the file at `index`, if the hash list carries one.
    pub fn file_hash(&self, index: usize) -> Option<&str> {
        self.model_file_hashes
            .get(index)
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Validate the structural invariants of this record.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_id.trim().is_empty() {
            return Err("modelId must not be empty".to_string());
        }
        if self.download_url.trim().is_empty() {
            return Err(format!("model '{}' has an empty downloadUrl", self.model_id));
        }
        if self.model_file_names.is_empty() {
            return Err(format!("model '{}' lists no files", self.model_id));
        }
        if !self.model_file_hashes.is_empty()
            && self.model_file_hashes.len() != self.model_file_names.len()
        {
            return Err(format!(
                "model '{}': {} file hashes for {} files",
                self.model_id,
                self.model_file_hashes.len(),
                self.model_file_names.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata {
            model_id: "silero-vad-v5".to_string(),
            module_kind: ModuleKind::VoiceActivityDetection,
            download_url: "https://example.com/silero_vad.onnx".to_string(),
            download_file_hash: None,
            model_file_names: vec!["silero_vad.onnx".to_string()],
            model_file_hashes: vec![],
        }
    }

    #[test]
    fn test_kind_dir_names_are_kebab() {
        assert_eq!(
            ModuleKind::VoiceActivityDetection.as_dir_name(),
            "voice-activity-detection"
        );
        assert_eq!(ModuleKind::KeywordSpotting.as_dir_name(), "keyword-spotting");
        assert_eq!(
            ModuleKind::SpokenLanguageIdentification.as_dir_name(),
            "spoken-language-identification"
        );
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let mut meta = sample();
        meta.model_id = "  ".to_string();
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hash_length_mismatch() {
        let mut meta = sample();
        meta.model_file_hashes = vec!["aa".to_string(), "bb".to_string()];
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_file_hash_empty_entries_are_none() {
        let mut meta = sample();
        meta.model_file_hashes = vec![String::new()];
        assert_eq!(meta.file_hash(0), None);
        assert_eq!(meta.file_hash(1), None);
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: ModelMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model_id, "silero-vad-v5");
        assert_eq!(back.module_kind, ModuleKind::VoiceActivityDetection);
    }
}
