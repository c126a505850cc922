use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::StorageClient;

pub struct UploadItem {
    pub body: Bytes,
    pub content_type: String,
}

/// Which profile image a file is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Avatar,
    Cover,
}

impl ImageSlot {
    fn prefix(self) -> &'static str {
        match self {
            ImageSlot::Avatar => "avatar",
            ImageSlot::Cover => "cover",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub key: String,
    pub url: String,
}

/// Returns `None` when the upload is not a supported image type.
pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

pub async fn upload_profile_image(
    storage: &dyn StorageClient,
    user_name: &str,
    slot: ImageSlot,
    item: UploadItem,
) -> anyhow::Result<UploadedImage> {
    let ext = ext_from_mime(&item.content_type).unwrap_or("bin");
    let key = format!("users/{}/{}-{}.{}", user_name, slot.prefix(), Uuid::new_v4(), ext);
    storage
        .put_object(&key, item.body, &item.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;
    debug!(%key, "profile image uploaded");
    Ok(UploadedImage {
        url: storage.object_url(&key),
        key,
    })
}

/// Best-effort removal of images whose registration did not go through.
pub async fn discard_images(storage: &dyn StorageClient, images: &[UploadedImage]) {
    for img in images {
        if let Err(e) = storage.delete_object(&img.key).await {
            warn!(error = %e, key = %img.key, "failed to delete orphaned image");
        }
    }
}
