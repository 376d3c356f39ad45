use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use clinflow_core::{Artifact, ArtifactKind, CaseId};

/// Image formats the normalizer accepts.
const SUPPORTED_IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "dcm", "tif", "tiff"];

/// Fixed representation of a case's raw artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedInput {
    /// Opaque reference to the preprocessed tensor held by the collaborator.
    pub tensor_ref: String,
    /// Normalization parameters (model-specific).
    pub params: JsonValue,
    /// Normalized notes text (empty for image-only cases).
    pub notes: String,
    /// File names of the image artifacts, in upload order.
    pub image_names: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("malformed input ({code}): {message}")]
    MalformedInput { code: &'static str, message: String },
}

impl PreprocessError {
    pub fn malformed(code: &'static str, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            code,
            message: message.into(),
        }
    }
}

/// Normalizes raw artifacts into the representation inference consumes.
pub trait Preprocessor: Send + Sync + 'static {
    fn normalize(
        &self,
        case_id: CaseId,
        artifacts: &[Artifact],
    ) -> Result<NormalizedInput, PreprocessError>;
}

/// Default preprocessor: validates artifacts and derives a tensor reference.
///
/// Pixel-level image normalization is the imaging collaborator's job; this
/// only checks that every image is in a format it can take.
#[derive(Debug, Clone, Default)]
pub struct ArtifactNormalizer;

impl ArtifactNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Preprocessor for ArtifactNormalizer {
    fn normalize(
        &self,
        case_id: CaseId,
        artifacts: &[Artifact],
    ) -> Result<NormalizedInput, PreprocessError> {
        let mut notes = Vec::new();
        let mut image_names = Vec::new();

        for artifact in artifacts {
            if artifact.case_id != case_id {
                return Err(PreprocessError::malformed(
                    "foreign_artifact",
                    format!("artifact {} belongs to another case", artifact.id),
                ));
            }
            match artifact.kind {
                ArtifactKind::InputNotes => {
                    if let Some(text) = artifact.content.as_deref().map(str::trim) {
                        if !text.is_empty() {
                            notes.push(text.to_string());
                        }
                    }
                }
                ArtifactKind::InputImage => {
                    let ext = artifact
                        .file_name
                        .rsplit_once('.')
                        .map(|(_, ext)| ext.to_ascii_lowercase())
                        .unwrap_or_default();
                    if !SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                        return Err(PreprocessError::malformed(
                            "unsupported_image",
                            format!("unsupported image format: {}", artifact.file_name),
                        ));
                    }
                    image_names.push(artifact.file_name.clone());
                }
            }
        }

        if notes.is_empty() && image_names.is_empty() {
            return Err(PreprocessError::malformed(
                "missing_input",
                "case has neither notes nor images",
            ));
        }

        let notes = notes.join("\n");
        Ok(NormalizedInput {
            tensor_ref: format!("tensor://{case_id}/{}", artifacts.len()),
            params: json!({
                "note_chars": notes.chars().count(),
                "image_count": image_names.len(),
            }),
            notes,
            image_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_only_case_normalizes() {
        let case_id = CaseId::new();
        let notes = Artifact::notes(case_id, "nodule 8mm, stable").unwrap().unwrap();

        let out = ArtifactNormalizer.normalize(case_id, &[notes]).unwrap();
        assert_eq!(out.notes, "nodule 8mm, stable");
        assert!(out.image_names.is_empty());
        assert_eq!(out.tensor_ref, format!("tensor://{case_id}/1"));
        assert_eq!(out.params["image_count"], 0);
    }

    #[test]
    fn empty_case_is_malformed() {
        let err = ArtifactNormalizer.normalize(CaseId::new(), &[]).unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::MalformedInput { code: "missing_input", .. }
        ));
    }

    #[test]
    fn unsupported_image_is_malformed() {
        let case_id = CaseId::new();
        let img = Artifact::image(case_id, "/tmp/scan.gif").unwrap();
        let err = ArtifactNormalizer.normalize(case_id, &[img]).unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::MalformedInput { code: "unsupported_image", .. }
        ));
    }

    #[test]
    fn dicom_image_is_accepted_case_insensitively() {
        let case_id = CaseId::new();
        let img = Artifact::image(case_id, "/data/CT_001.DCM").unwrap();
        let out = ArtifactNormalizer.normalize(case_id, &[img]).unwrap();
        assert_eq!(out.image_names, vec!["CT_001.DCM"]);
    }
}
