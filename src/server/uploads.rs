use serde::Deserialize;

/// Result of a successful upload: a durable URL plus the identifier the
/// hosting service uses for later management.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    pub url: String,
    pub public_id: String,
}

/// Client for the media hosting service. The relay hands it the inline
/// base64 payload and persists only the returned URL and identifier.
#[derive(Debug, Clone)]
pub struct MediaUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl MediaUploader {
    pub fn new(endpoint: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }

    pub async fn upload(&self, image_base64: &str, folder: &str) -> anyhow::Result<UploadedImage> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "image": image_base64, "folder": folder }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("upload service returned {}", response.status());
        }

        let uploaded = response.json::<UploadedImage>().await?;
        log::info!("[UPLOAD] Stored image {} in folder {}", uploaded.public_id, folder);
        Ok(uploaded)
    }
}
