use anyhow::Context;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::drafts::repo_types::MealImage;
use crate::storage::StorageClient;

pub struct UploadItem<'a> {
    pub body: Bytes,
    pub content_type: &'a str,
}

/// Store the bytes under the owner's prefix and return a reference the
/// draft can carry.
pub async fn upload_meal_image(
    storage: &dyn StorageClient,
    owner: Uuid,
    image: UploadItem<'_>,
    presign_ttl_secs: u64,
) -> anyhow::Result<MealImage> {
    anyhow::ensure!(!image.body.is_empty(), "empty image upload");

    let ext = ext_from_mime(image.content_type).unwrap_or("bin");
    let key = format!("{}{}.{}", owner_prefix(owner), Uuid::new_v4(), ext);
    let size = image.body.len() as u64;

    storage
        .put_object(&key, image.body, image.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;

    let download_url = storage
        .presign_get(&key, presign_ttl_secs)
        .await
        .with_context(|| format!("presign url for {}", key))?;

    Ok(MealImage {
        storage_path: key,
        download_url,
        size,
        content_type: image.content_type.to_string(),
        uploaded_at: OffsetDateTime::now_utc(),
    })
}

/// Every object an owner uploads lives under this prefix. Client-supplied
/// image references outside it are rejected.
pub fn owner_prefix(owner: Uuid) -> String {
    format!("drafts/{}/", owner)
}

pub fn owns_image(owner: Uuid, image: &MealImage) -> bool {
    let path = image.storage_path.trim();
    let prefix = owner_prefix(owner);
    path.len() > prefix.len() && path.starts_with(&prefix) && !path.contains("..")
}

pub fn is_image_mime(ct: &str) -> bool {
    ct.starts_with("image/")
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
