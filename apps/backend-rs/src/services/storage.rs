use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{presigning::PresigningConfig, Client};
use serde::Serialize;

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
};

/// S3-compatible bucket (AWS S3 or Cloudflare R2 through a custom endpoint).
#[derive(Clone)]
pub struct ObjectStorage {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub method: &'static str,
    pub object_key: String,
    pub expires_in_seconds: u64,
}

impl ObjectStorage {
    /// `None` when no bucket is configured.
    pub async fn from_config(config: &AppConfig) -> Option<Self> {
        let bucket = config
            .storage_bucket
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?
            .to_string();

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.storage_region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = config.storage_endpoint_url.as_deref() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Some(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            presign_ttl: Duration::from_secs(config.storage_presign_ttl_seconds.max(60)),
        })
    }

    pub async fn presign_upload(&self, object_key: &str, content_type: &str) -> AppResult<PresignedUrl> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type(content_type)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, object_key, "Failed to presign upload");
                AppError::Dependency("Could not create upload URL.".to_string())
            })?;

        Ok(PresignedUrl {
            url: request.uri().to_string(),
            method: "PUT",
            object_key: object_key.to_string(),
            expires_in_seconds: self.presign_ttl.as_secs(),
        })
    }

    pub async fn presign_download(&self, object_key: &str) -> AppResult<PresignedUrl> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, object_key, "Failed to presign download");
                AppError::Dependency("Could not create download URL.".to_string())
            })?;

        Ok(PresignedUrl {
            url: request.uri().to_string(),
            method: "GET",
            object_key: object_key.to_string(),
            expires_in_seconds: self.presign_ttl.as_secs(),
        })
    }

    fn presigning_config(&self) -> AppResult<PresigningConfig> {
        PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|error| AppError::Internal(format!("Invalid presign duration: {error}")))
    }
}

/// `orgs/{org}/document-requests/{request}/{file}` with the file name reduced
/// to a safe character set.
pub fn document_object_key(organization_id: &str, request_id: &str, file_name: &str) -> String {
    format!(
        "orgs/{organization_id}/document-requests/{request_id}/{}",
        sanitize_file_name(file_name)
    )
}

fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned = base
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.').chars().take(120).collect::<String>();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::{document_object_key, sanitize_file_name};

    #[test]
    fn file_names_are_flattened_and_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\pay stub (May).pdf"), "pay_stub__May_.pdf");
        assert_eq!(sanitize_file_name(".env"), "env");
        assert_eq!(sanitize_file_name("   "), "upload");
    }

    #[test]
    fn object_keys_are_scoped_by_org_and_request() {
        assert_eq!(
            document_object_key("org-1", "req-9", "id card.png"),
            "orgs/org-1/document-requests/req-9/id_card.png"
        );
    }
}
