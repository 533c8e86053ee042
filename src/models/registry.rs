use super::types::{ModelFamily, ModelInfo, SYSTEM_MODEL_ID};

/// Asset URL on the voice model release page.
macro_rules! release_url {
    ($file:literal) => {
        concat!("https://github.com/k2-fsa/sherpa-onnx/releases/download/tts-models/", $file)
    };
}

static DOWNLOADABLE: [ModelInfo; 4] = [
    ModelInfo {
        id: "piper-libritts-medium",
        display_name: "Piper English (LibriTTS Medium)",
        family: ModelFamily::Piper,
        languages: &["en"],
        download_url: release_url!("vits-piper-en_US-libritts-high.tar.bz2"),
        size_bytes: 75_000_000,
        num_speakers: 904,
        model_file: "en_US-libritts-high.onnx",
        tokens_file: "tokens.txt",
        archive_dir: "vits-piper-en_US-libritts-high",
        description: "High quality English multi-speaker model",
        sha256: None,
    },
    ModelInfo {
        id: "piper-amy-low",
        display_name: "Piper English (Amy Low)",
        family: ModelFamily::Piper,
        languages: &["en"],
        download_url: release_url!("vits-piper-en_US-amy-low.tar.bz2"),
        size_bytes: 20_000_000,
        num_speakers: 1,
        model_file: "en_US-amy-low.onnx",
        tokens_file: "tokens.txt",
        archive_dir: "vits-piper-en_US-amy-low",
        description: "Lightweight English single-speaker model",
        sha256: None,
    },
    ModelInfo {
        id: "kokoro-multi-v1",
        display_name: "Kokoro Multi-Language v1.0",
        family: ModelFamily::Kokoro,
        languages: &["en", "zh", "ja", "ko", "fr", "de", "es", "it"],
        download_url: release_url!("kokoro-multi-lang-v1_0.tar.bz2"),
        size_bytes: 80_000_000,
        num_speakers: 53,
        model_file: "model.onnx",
        tokens_file: "tokens.txt",
        archive_dir: "kokoro-multi-lang-v1_0",
        description: "Multi-language model supporting 8 languages",
        sha256: None,
    },
    ModelInfo {
        id: "vits-zh-fanchen",
        display_name: "VITS Chinese (Fanchen)",
        family: ModelFamily::VitsChinese,
        languages: &["zh"],
        download_url: release_url!("vits-zh-fanchen.tar.bz2"),
        size_bytes: 115_000_000,
        num_speakers: 187,
        model_file: "model.onnx",
        tokens_file: "tokens.txt",
        archive_dir: "vits-zh-fanchen",
        description: "Chinese multi-speaker model",
        sha256: None,
    },
];

static SYSTEM: ModelInfo = ModelInfo {
    id: SYSTEM_MODEL_ID,
    display_name: "System TTS",
    family: ModelFamily::System,
    languages: &["*"],
    download_url: "",
    size_bytes: 0,
    num_speakers: 0,
    model_file: "",
    tokens_file: "",
    archive_dir: "",
    description: "Uses the host's built-in speech service",
    sha256: None,
};

/// The platform entry.
pub fn system_model() -> &'static ModelInfo {
    &SYSTEM
}

/// Models that must be downloaded before use.
pub fn downloadable_models() -> &'static [ModelInfo] {
    &DOWNLOADABLE
}

/// Every model, downloadable ones first and the platform entry last.
pub fn all_models() -> Vec<&'static ModelInfo> {
    DOWNLOADABLE.iter().chain(std::iter::once(&SYSTEM)).collect()
}

pub fn model_by_id(id: &str) -> Option<&'static ModelInfo> {
    if id == SYSTEM_MODEL_ID {
        return Some(&SYSTEM);
    }
    DOWNLOADABLE.iter().find(|m| m.id == id)
}
