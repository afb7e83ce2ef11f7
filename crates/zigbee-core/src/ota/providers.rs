//! OTA image providers
//!
//! A provider lists firmware images keyed by (manufacturer code, image type,
//! file version). The local directory scanner serves files straight from
//! disk; the HTTP providers fetch a vendor index on `refresh()` and download
//! image binaries on demand.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use zigbee_wire::ota::{OtaImage, OtaImageHeader};

use crate::error::CoreError;

/// Tie-break rank when several providers offer the same image: a lower rank
/// wins when file versions are equal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderRank {
    LocalDirectory = 0,
    FirstParty = 1,
    Aggregate = 2,
}

/// A fully downloaded and parsed image
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub header: OtaImageHeader,
    /// Serialized image bytes, exactly as served to devices
    pub data: Vec<u8>,
}

impl CachedImage {
    pub fn from_bytes(data: &[u8]) -> Result<Self, CoreError> {
        let image = OtaImage::parse(data)?;
        let wire = image.to_wire()?;
        Ok(Self {
            header: image.header,
            data: wire,
        })
    }

    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Index entry of a remote provider, downloaded lazily
#[derive(Debug, Clone)]
pub struct RemoteImageMeta {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub url: String,
    pub min_hardware_version: Option<u16>,
    pub max_hardware_version: Option<u16>,
}

impl RemoteImageMeta {
    fn matches(&self, manufacturer: u16, image_type: u16, hw_version: Option<u16>) -> bool {
        if self.manufacturer_code != manufacturer || self.image_type != image_type {
            return false;
        }
        match (hw_version, self.min_hardware_version, self.max_hardware_version) {
            (Some(hw), Some(min), Some(max)) => (min..=max).contains(&hw),
            _ => true,
        }
    }
}

#[async_trait]
pub trait OtaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn rank(&self) -> ProviderRank;

    /// Whether this provider can ever serve images for the manufacturer
    fn is_compatible(&self, _manufacturer: u16) -> bool {
        true
    }

    /// Re-read the provider's index
    async fn refresh(&self) -> Result<(), CoreError>;

    /// Best matching image, already downloaded and parsed
    async fn get_image(
        &self,
        manufacturer: u16,
        image_type: u16,
        hw_version: Option<u16>,
    ) -> Option<Arc<CachedImage>>;
}

// --- Local directory ------------------------------------------------------

/// Serves `.ota` / `.zigbee` files from a local directory
pub struct DirectoryProvider {
    directory: PathBuf,
    images: RwLock<Vec<Arc<CachedImage>>>,
}

impl DirectoryProvider {
    #[must_use]
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            images: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OtaProvider for DirectoryProvider {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn rank(&self) -> ProviderRank {
        ProviderRank::LocalDirectory
    }

    async fn refresh(&self) -> Result<(), CoreError> {
        let mut images = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|err| CoreError::DeliveryFailed(format!("OTA directory: {err}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            if extension != "ota" && extension != "zigbee" {
                continue;
            }

            match tokio::fs::read(&path).await {
                Ok(data) => match CachedImage::from_bytes(&data) {
                    Ok(image) => {
                        tracing::debug!(
                            "Found OTA image {:?}: manufacturer={:#06x} type={:#06x} version={:#010x}",
                            path,
                            image.header.manufacturer_code,
                            image.header.image_type,
                            image.header.file_version
                        );
                        images.push(Arc::new(image));
                    }
                    Err(err) => tracing::warn!("Ignoring invalid OTA file {path:?}: {err}"),
                },
                Err(err) => tracing::warn!("Cannot read OTA file {path:?}: {err}"),
            }
        }

        tracing::info!(
            "OTA directory {:?} holds {} images",
            self.directory,
            images.len()
        );
        *self.images.write().await = images;
        Ok(())
    }

    async fn get_image(
        &self,
        manufacturer: u16,
        image_type: u16,
        hw_version: Option<u16>,
    ) -> Option<Arc<CachedImage>> {
        self.images
            .read()
            .await
            .iter()
            .filter(|img| {
                img.header.manufacturer_code == manufacturer
                    && img.header.image_type == image_type
                    && img.header.matches_hardware(hw_version)
            })
            .max_by_key(|img| img.header.file_version)
            .cloned()
    }
}

// --- Remote providers -----------------------------------------------------

/// Shared machinery for the HTTP-backed providers: a refreshable metadata
/// index plus a download cache
struct RemoteIndex {
    metas: RwLock<Vec<RemoteImageMeta>>,
    downloads: RwLock<HashMap<(u16, u16, u32), Arc<CachedImage>>>,
    client: reqwest::Client,
}

impl RemoteIndex {
    fn new() -> Self {
        Self {
            metas: RwLock::new(Vec::new()),
            downloads: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    async fn replace(&self, metas: Vec<RemoteImageMeta>) {
        *self.metas.write().await = metas;
    }

    async fn best_match(
        &self,
        manufacturer: u16,
        image_type: u16,
        hw_version: Option<u16>,
    ) -> Option<RemoteImageMeta> {
        self.metas
            .read()
            .await
            .iter()
            .filter(|meta| meta.matches(manufacturer, image_type, hw_version))
            .max_by_key(|meta| meta.file_version)
            .cloned()
    }

    async fn download(&self, meta: &RemoteImageMeta) -> Option<Arc<CachedImage>> {
        let key = (meta.manufacturer_code, meta.image_type, meta.file_version);
        if let Some(image) = self.downloads.read().await.get(&key) {
            return Some(image.clone());
        }

        let response = match self.client.get(&meta.url).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Failed to download OTA image {}: {err}", meta.url);
                return None;
            }
        };
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Failed to read OTA image body {}: {err}", meta.url);
                return None;
            }
        };

        match CachedImage::from_bytes(&bytes) {
            Ok(image) => {
                let image = Arc::new(image);
                self.downloads.write().await.insert(key, image.clone());
                Some(image)
            }
            Err(err) => {
                tracing::warn!("Invalid OTA image at {}: {err}", meta.url);
                None
            }
        }
    }
}

fn value_u16(value: &serde_json::Value) -> Option<u16> {
    value.as_u64().and_then(|v| u16::try_from(v).ok())
}

fn value_u32(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

macro_rules! remote_provider {
    ($name:ident, $label:expr, $rank:expr, $default_url:expr) => {
        pub struct $name {
            url: String,
            index: RemoteIndex,
            manufacturer_codes: Option<&'static [u16]>,
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::with_url($default_url.to_string())
            }

            #[must_use]
            pub fn with_url(url: String) -> Self {
                Self {
                    url,
                    index: RemoteIndex::new(),
                    manufacturer_codes: Self::MANUFACTURER_CODES,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        #[async_trait]
        impl OtaProvider for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn rank(&self) -> ProviderRank {
                $rank
            }

            fn is_compatible(&self, manufacturer: u16) -> bool {
                match self.manufacturer_codes {
                    Some(codes) => codes.contains(&manufacturer),
                    None => true,
                }
            }

            async fn refresh(&self) -> Result<(), CoreError> {
                let body: serde_json::Value = self
                    .index
                    .client
                    .get(&self.url)
                    .send()
                    .await
                    .map_err(|err| CoreError::DeliveryFailed(err.to_string()))?
                    .json()
                    .await
                    .map_err(|err| CoreError::DeliveryFailed(err.to_string()))?;

                let metas = Self::parse_index(&body);
                tracing::info!("{} index lists {} images", $label, metas.len());
                self.index.replace(metas).await;
                Ok(())
            }

            async fn get_image(
                &self,
                manufacturer: u16,
                image_type: u16,
                hw_version: Option<u16>,
            ) -> Option<Arc<CachedImage>> {
                if !self.is_compatible(manufacturer) {
                    return None;
                }
                let meta = self
                    .index
                    .best_match(manufacturer, image_type, hw_version)
                    .await?;
                self.index.download(&meta).await
            }
        }
    };
}

remote_provider!(
    IkeaProvider,
    "ikea",
    ProviderRank::FirstParty,
    "https://fw.ota.homesmart.ikea.com/check/update/prod"
);

impl IkeaProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = Some(&[4476]);

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        // DIRIGERA-era index: fw_image_type + a version pair embedded in
        // the metadata
        let mut metas = Vec::new();
        for entry in body.as_array().into_iter().flatten() {
            let Some(image_type) = entry.get("fw_image_type").and_then(value_u16) else {
                continue;
            };
            let Some(url) = entry.get("fw_binary_url").and_then(|v| v.as_str()) else {
                continue;
            };
            let major = entry.get("fw_major_version").and_then(value_u32);
            let minor = entry.get("fw_minor_version").and_then(value_u32);
            let file_version = match (major, minor) {
                (Some(major), Some(minor)) => (major << 24) | (minor << 16),
                _ => continue,
            };
            metas.push(RemoteImageMeta {
                manufacturer_code: 4476,
                image_type,
                file_version,
                url: url.to_string(),
                min_hardware_version: None,
                max_hardware_version: None,
            });
        }
        metas
    }
}

remote_provider!(
    LedvanceProvider,
    "ledvance",
    ProviderRank::FirstParty,
    "https://api.update.ledvance.com/v1/zigbee/firmwares"
);

impl LedvanceProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = Some(&[4489, 4364]);

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        let mut metas = Vec::new();
        for fw in body
            .get("firmwares")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let Some(identity) = fw.get("identity") else {
                continue;
            };
            let Some(company) = identity.get("company").and_then(value_u16) else {
                continue;
            };
            let Some(product) = identity.get("product").and_then(value_u16) else {
                continue;
            };
            let Some(version) = fw.get("fullName").and_then(|v| v.as_str()) else {
                continue;
            };
            // fullName ends in a /-separated hex revision
            let Some(file_version) = version
                .rsplit('/')
                .next()
                .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            else {
                continue;
            };
            metas.push(RemoteImageMeta {
                manufacturer_code: company,
                image_type: product,
                file_version,
                url: format!(
                    "https://api.update.ledvance.com/v1/zigbee/firmwares/download?company={company}&product={product}&version={version}"
                ),
                min_hardware_version: None,
                max_hardware_version: None,
            });
        }
        metas
    }
}

remote_provider!(
    SonoffProvider,
    "sonoff",
    ProviderRank::FirstParty,
    "https://zigbee-ota.sonoff.tech/releases/upgrade.json"
);

impl SonoffProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = Some(&[4742]);

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        let mut metas = Vec::new();
        for fw in body.as_array().into_iter().flatten() {
            let (Some(manufacturer), Some(image_type), Some(file_version), Some(url)) = (
                fw.get("fw_manufacturer_id").and_then(value_u16),
                fw.get("fw_image_type").and_then(value_u16),
                fw.get("fw_file_version").and_then(value_u32),
                fw.get("fw_binary_url").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            metas.push(RemoteImageMeta {
                manufacturer_code: manufacturer,
                image_type,
                file_version,
                url: url.to_string(),
                min_hardware_version: None,
                max_hardware_version: None,
            });
        }
        metas
    }
}

remote_provider!(
    InovelliProvider,
    "inovelli",
    ProviderRank::FirstParty,
    "https://files.inovelli.com/firmware/firmware-zha-v2.json"
);

impl InovelliProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = Some(&[4655]);

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        let mut metas = Vec::new();
        for (_model, entries) in body.as_object().into_iter().flatten() {
            for fw in entries.as_array().into_iter().flatten() {
                let (Some(version), Some(url), Some(manufacturer), Some(image_type)) = (
                    fw.get("version")
                        .and_then(|v| v.as_str())
                        .and_then(|v| u32::from_str_radix(v, 16).ok()),
                    fw.get("firmware").and_then(|v| v.as_str()),
                    fw.get("manufacturer_id").and_then(value_u16),
                    fw.get("image_type").and_then(value_u16),
                ) else {
                    continue;
                };
                metas.push(RemoteImageMeta {
                    manufacturer_code: manufacturer,
                    image_type,
                    file_version: version,
                    url: url.to_string(),
                    min_hardware_version: None,
                    max_hardware_version: None,
                });
            }
        }
        metas
    }
}

remote_provider!(
    SalusProvider,
    "salus",
    ProviderRank::FirstParty,
    "https://eu.salusconnect.io/demo/default/status/firmware"
);

impl SalusProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = Some(&[4216]);

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        let mut metas = Vec::new();
        for fw in body
            .get("versions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let (Some(version), Some(url)) = (
                fw.get("version")
                    .and_then(|v| v.as_str())
                    .and_then(|v| u32::from_str_radix(v, 16).ok()),
                fw.get("url").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            // The Salus index carries no image type; the image header is
            // authoritative after download
            metas.push(RemoteImageMeta {
                manufacturer_code: 4216,
                image_type: 0xFFFF,
                file_version: version,
                url: url.replace("http://", "https://"),
                min_hardware_version: None,
                max_hardware_version: None,
            });
        }
        metas
    }
}

remote_provider!(
    RemoteIndexProvider,
    "remote-index",
    ProviderRank::Aggregate,
    "https://raw.githubusercontent.com/Koenkk/zigbee-OTA/master/index.json"
);

impl RemoteIndexProvider {
    const MANUFACTURER_CODES: Option<&'static [u16]> = None;

    fn parse_index(body: &serde_json::Value) -> Vec<RemoteImageMeta> {
        let mut metas = Vec::new();
        for fw in body.as_array().into_iter().flatten() {
            let (Some(manufacturer), Some(image_type), Some(file_version), Some(url)) = (
                fw.get("manufacturerCode").and_then(value_u16),
                fw.get("imageType").and_then(value_u16),
                fw.get("fileVersion").and_then(value_u32),
                fw.get("url").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            metas.push(RemoteImageMeta {
                manufacturer_code: manufacturer,
                image_type,
                file_version,
                url: url.to_string(),
                min_hardware_version: fw.get("minHardwareVersion").and_then(value_u16),
                max_hardware_version: fw.get("maxHardwareVersion").and_then(value_u16),
            });
        }
        metas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_index_parse() {
        let body = serde_json::json!([
            {
                "manufacturerCode": 4476,
                "imageType": 8705,
                "fileVersion": 0x0100_0020u32,
                "url": "https://example.invalid/fw.ota"
            },
            {"broken": true}
        ]);
        let metas = RemoteIndexProvider::parse_index(&body);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].manufacturer_code, 4476);
        assert_eq!(metas[0].file_version, 0x0100_0020);
    }

    #[test]
    fn test_sonoff_parse() {
        let body = serde_json::json!([
            {
                "fw_manufacturer_id": 4742,
                "fw_image_type": 1,
                "fw_file_version": 6,
                "fw_binary_url": "https://example.invalid/sonoff.ota"
            }
        ]);
        let metas = SonoffProvider::parse_index(&body);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].image_type, 1);
    }

    #[test]
    fn test_meta_hardware_gate() {
        let meta = RemoteImageMeta {
            manufacturer_code: 1,
            image_type: 2,
            file_version: 3,
            url: String::new(),
            min_hardware_version: Some(1),
            max_hardware_version: Some(3),
        };
        assert!(meta.matches(1, 2, Some(2)));
        assert!(!meta.matches(1, 2, Some(4)));
        assert!(meta.matches(1, 2, None));
        assert!(!meta.matches(9, 2, None));
    }

    #[test]
    fn test_provider_rank_ordering() {
        assert!(ProviderRank::LocalDirectory < ProviderRank::FirstParty);
        assert!(ProviderRank::FirstParty < ProviderRank::Aggregate);
    }
}
