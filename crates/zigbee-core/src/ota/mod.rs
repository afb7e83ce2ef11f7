//! OTA upgrade engine
//!
//! The coordinator plays the OTA cluster (0x0019) server role: devices query
//! for new firmware, pull it block by block and announce the outcome. Image
//! selection is delegated to a priority-ordered provider set; the engine
//! tracks a per-device upgrade state machine
//! (idle → querying → downloading → waiting_to_apply → applied | failed).

pub mod providers;

use dashmap::DashMap;
use std::sync::Arc;
use zigbee_wire::zcl::Status;
use zigbee_wire::{Eui64, WireError, WireFormat};

use crate::config::OtaConfig;
use providers::{
    CachedImage, DirectoryProvider, IkeaProvider, InovelliProvider, LedvanceProvider, OtaProvider,
    RemoteIndexProvider, SalusProvider, SonoffProvider,
};

/// OTA cluster command ids received by the server
pub mod server_commands {
    pub const QUERY_NEXT_IMAGE: u8 = 0x01;
    pub const IMAGE_BLOCK: u8 = 0x03;
    pub const IMAGE_PAGE: u8 = 0x04;
    pub const UPGRADE_END: u8 = 0x06;
}

/// OTA cluster command ids generated by the server
pub mod client_commands {
    pub const IMAGE_NOTIFY: u8 = 0x00;
    pub const QUERY_NEXT_IMAGE_RESPONSE: u8 = 0x02;
    pub const IMAGE_BLOCK_RESPONSE: u8 = 0x05;
    pub const UPGRADE_END_RESPONSE: u8 = 0x07;
}

/// Largest block the server hands out regardless of what the device asks for
pub const MAX_BLOCK_SIZE: u8 = 64;

/// Query-Next-Image request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNextImage {
    pub field_control: u8,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub current_file_version: u32,
    pub hardware_version: Option<u16>,
}

impl WireFormat for QueryNextImage {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.field_control);
        self.manufacturer_code.serialize(out);
        self.image_type.serialize(out);
        self.current_file_version.serialize(out);
        if let Some(hw) = self.hardware_version {
            hw.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (field_control, data) = u8::deserialize(data)?;
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (current_file_version, mut data) = u32::deserialize(data)?;
        let mut hardware_version = None;
        if field_control & 0x01 != 0 {
            let (hw, rest) = u16::deserialize(data)?;
            hardware_version = Some(hw);
            data = rest;
        }
        Ok((
            Self {
                field_control,
                manufacturer_code,
                image_type,
                current_file_version,
                hardware_version,
            },
            data,
        ))
    }
}

/// Query-Next-Image response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNextImageResponse {
    pub status: Status,
    pub manufacturer_code: Option<u16>,
    pub image_type: Option<u16>,
    pub file_version: Option<u32>,
    pub image_size: Option<u32>,
}

impl QueryNextImageResponse {
    #[must_use]
    pub fn no_image() -> Self {
        Self {
            status: Status::NoImageAvailable,
            manufacturer_code: None,
            image_type: None,
            file_version: None,
            image_size: None,
        }
    }
}

impl WireFormat for QueryNextImageResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        if self.status == Status::Success {
            if let (Some(manufacturer), Some(image_type), Some(version), Some(size)) = (
                self.manufacturer_code,
                self.image_type,
                self.file_version,
                self.image_size,
            ) {
                manufacturer.serialize(out);
                image_type.serialize(out);
                version.serialize(out);
                size.serialize(out);
            }
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = Status::deserialize(data)?;
        if status != Status::Success {
            return Ok((
                Self {
                    status,
                    manufacturer_code: None,
                    image_type: None,
                    file_version: None,
                    image_size: None,
                },
                data,
            ));
        }
        let (manufacturer, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (version, data) = u32::deserialize(data)?;
        let (size, data) = u32::deserialize(data)?;
        Ok((
            Self {
                status,
                manufacturer_code: Some(manufacturer),
                image_type: Some(image_type),
                file_version: Some(version),
                image_size: Some(size),
            },
            data,
        ))
    }
}

/// Image-Block request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlockRequest {
    pub field_control: u8,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub maximum_data_size: u8,
    pub request_node_addr: Option<Eui64>,
    pub minimum_block_period: Option<u16>,
}

impl WireFormat for ImageBlockRequest {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.field_control);
        self.manufacturer_code.serialize(out);
        self.image_type.serialize(out);
        self.file_version.serialize(out);
        self.file_offset.serialize(out);
        out.push(self.maximum_data_size);
        if let Some(addr) = self.request_node_addr {
            addr.serialize(out);
        }
        if let Some(period) = self.minimum_block_period {
            period.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (field_control, data) = u8::deserialize(data)?;
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (file_version, data) = u32::deserialize(data)?;
        let (file_offset, data) = u32::deserialize(data)?;
        let (maximum_data_size, mut data) = u8::deserialize(data)?;

        let mut request_node_addr = None;
        if field_control & 0x01 != 0 {
            let (addr, rest) = Eui64::deserialize(data)?;
            request_node_addr = Some(addr);
            data = rest;
        }
        let mut minimum_block_period = None;
        if field_control & 0x02 != 0 {
            let (period, rest) = u16::deserialize(data)?;
            minimum_block_period = Some(period);
            data = rest;
        }

        Ok((
            Self {
                field_control,
                manufacturer_code,
                image_type,
                file_version,
                file_offset,
                maximum_data_size,
                request_node_addr,
                minimum_block_period,
            },
            data,
        ))
    }
}

/// Image-Block response payload; only the success form carries data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBlockResponse {
    Success {
        manufacturer_code: u16,
        image_type: u16,
        file_version: u32,
        file_offset: u32,
        image_data: Vec<u8>,
    },
    Abort,
}

impl WireFormat for ImageBlockResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Self::Success {
                manufacturer_code,
                image_type,
                file_version,
                file_offset,
                image_data,
            } => {
                Status::Success.serialize(out);
                manufacturer_code.serialize(out);
                image_type.serialize(out);
                file_version.serialize(out);
                file_offset.serialize(out);
                out.push(image_data.len() as u8);
                out.extend_from_slice(image_data);
            }
            Self::Abort => Status::Abort.serialize(out),
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = Status::deserialize(data)?;
        if status != Status::Success {
            return Ok((Self::Abort, data));
        }
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (file_version, data) = u32::deserialize(data)?;
        let (file_offset, data) = u32::deserialize(data)?;
        let (length, data) = u8::deserialize(data)?;
        let length = usize::from(length);
        WireError::check_len(data, length)?;
        Ok((
            Self::Success {
                manufacturer_code,
                image_type,
                file_version,
                file_offset,
                image_data: data[..length].to_vec(),
            },
            &data[length..],
        ))
    }
}

/// Upgrade-End request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEndRequest {
    pub status: Status,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
}

impl WireFormat for UpgradeEndRequest {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        self.manufacturer_code.serialize(out);
        self.image_type.serialize(out);
        self.file_version.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = Status::deserialize(data)?;
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (file_version, data) = u32::deserialize(data)?;
        Ok((
            Self {
                status,
                manufacturer_code,
                image_type,
                file_version,
            },
            data,
        ))
    }
}

/// Upgrade-End response payload; zero times mean "apply immediately"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEndResponse {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub current_time: u32,
    pub upgrade_time: u32,
}

impl WireFormat for UpgradeEndResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.manufacturer_code.serialize(out);
        self.image_type.serialize(out);
        self.file_version.serialize(out);
        self.current_time.serialize(out);
        self.upgrade_time.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (file_version, data) = u32::deserialize(data)?;
        let (current_time, data) = u32::deserialize(data)?;
        let (upgrade_time, data) = u32::deserialize(data)?;
        Ok((
            Self {
                manufacturer_code,
                image_type,
                file_version,
                current_time,
                upgrade_time,
            },
            data,
        ))
    }
}

/// Per-device upgrade progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Idle,
    Querying,
    Downloading,
    WaitingToApply,
    Applied,
    Failed,
}

#[derive(Clone, Default)]
struct OtaDeviceState {
    status: Option<OtaStatus>,
    image: Option<Arc<CachedImage>>,
    last_offset: u32,
}

/// The OTA engine: providers plus per-device state.
///
/// The engine makes protocol decisions; the controller owns frame transport.
pub struct OtaEngine {
    providers: Vec<Box<dyn OtaProvider>>,
    states: DashMap<Eui64, OtaDeviceState>,
}

impl OtaEngine {
    /// Providers selected by configuration
    #[must_use]
    pub fn new(config: &OtaConfig) -> Self {
        let mut providers: Vec<Box<dyn OtaProvider>> = Vec::new();

        if let Some(directory) = &config.otau_directory {
            providers.push(Box::new(DirectoryProvider::new(directory.clone())));
        }
        if config.ikea_provider {
            providers.push(Box::new(IkeaProvider::new()));
        }
        if config.ledvance_provider {
            providers.push(Box::new(LedvanceProvider::new()));
        }
        if config.sonoff_provider {
            providers.push(Box::new(SonoffProvider::new()));
        }
        if config.inovelli_provider {
            providers.push(Box::new(InovelliProvider::new()));
        }
        if config.salus_provider {
            providers.push(Box::new(SalusProvider::new()));
        }
        for url in &config.extra_providers {
            providers.push(Box::new(RemoteIndexProvider::with_url(url.clone())));
        }

        Self::with_providers(providers)
    }

    /// Explicit provider set; used by embedders and tests
    #[must_use]
    pub fn with_providers(providers: Vec<Box<dyn OtaProvider>>) -> Self {
        Self {
            providers,
            states: DashMap::new(),
        }
    }

    /// Refresh every provider index, tolerating individual failures
    pub async fn refresh(&self) {
        for provider in &self.providers {
            if let Err(err) = provider.refresh().await {
                tracing::warn!("OTA provider {} refresh failed: {err}", provider.name());
            }
        }
    }

    #[must_use]
    pub fn device_status(&self, ieee: Eui64) -> OtaStatus {
        self.states
            .get(&ieee)
            .and_then(|s| s.status)
            .unwrap_or(OtaStatus::Idle)
    }

    fn set_state(&self, ieee: Eui64, f: impl FnOnce(&mut OtaDeviceState)) {
        let mut entry = self.states.entry(ieee).or_default();
        f(&mut entry);
    }

    /// Pick the best candidate strictly newer than the running version.
    /// Highest file version wins; on ties the provider with the lowest rank
    /// (local directory first, aggregate index last) does.
    pub async fn select_image(
        &self,
        manufacturer: u16,
        image_type: u16,
        current_version: u32,
        hw_version: Option<u16>,
    ) -> Option<Arc<CachedImage>> {
        let mut best: Option<(Arc<CachedImage>, providers::ProviderRank)> = None;

        for provider in &self.providers {
            if !provider.is_compatible(manufacturer) {
                continue;
            }
            let Some(image) = provider.get_image(manufacturer, image_type, hw_version).await
            else {
                continue;
            };
            if image.header.file_version <= current_version {
                continue;
            }

            let replace = match &best {
                None => true,
                Some((current, rank)) => {
                    image.header.file_version > current.header.file_version
                        || (image.header.file_version == current.header.file_version
                            && provider.rank() < *rank)
                }
            };
            if replace {
                best = Some((image, provider.rank()));
            }
        }

        best.map(|(image, _)| image)
    }

    /// Device asked whether newer firmware exists
    pub async fn handle_query_next_image(
        &self,
        ieee: Eui64,
        query: &QueryNextImage,
    ) -> QueryNextImageResponse {
        self.set_state(ieee, |s| s.status = Some(OtaStatus::Querying));

        let image = self
            .select_image(
                query.manufacturer_code,
                query.image_type,
                query.current_file_version,
                query.hardware_version,
            )
            .await;

        match image {
            Some(image) => {
                tracing::info!(
                    "Offering OTA image to {}: version {:#010x} -> {:#010x} ({} bytes)",
                    ieee,
                    query.current_file_version,
                    image.header.file_version,
                    image.total_size()
                );
                let response = QueryNextImageResponse {
                    status: Status::Success,
                    manufacturer_code: Some(image.header.manufacturer_code),
                    image_type: Some(image.header.image_type),
                    file_version: Some(image.header.file_version),
                    image_size: Some(image.total_size()),
                };
                self.set_state(ieee, |s| {
                    s.image = Some(image);
                    s.last_offset = 0;
                });
                response
            }
            None => {
                tracing::debug!("No OTA image available for {ieee}");
                self.set_state(ieee, |s| {
                    s.status = Some(OtaStatus::Idle);
                    s.image = None;
                });
                QueryNextImageResponse::no_image()
            }
        }
    }

    /// Device pulled the next block
    pub fn handle_image_block(&self, ieee: Eui64, request: &ImageBlockRequest) -> ImageBlockResponse {
        let image = self
            .states
            .get(&ieee)
            .and_then(|s| s.image.clone())
            .filter(|image| image.header.file_version == request.file_version);

        let Some(image) = image else {
            tracing::debug!("Image block request from {ieee} without an offered image");
            self.set_state(ieee, |s| s.status = Some(OtaStatus::Failed));
            return ImageBlockResponse::Abort;
        };

        let total = image.total_size();
        if request.file_offset >= total {
            tracing::warn!(
                "Image block request from {ieee} beyond image end: {} >= {total}",
                request.file_offset
            );
            self.set_state(ieee, |s| s.status = Some(OtaStatus::Failed));
            return ImageBlockResponse::Abort;
        }

        let offset = request.file_offset as usize;
        let size = usize::from(request.maximum_data_size.min(MAX_BLOCK_SIZE))
            .min(total as usize - offset);
        let block = image.data[offset..offset + size].to_vec();

        self.set_state(ieee, |s| {
            if request.file_offset < s.last_offset {
                tracing::debug!(
                    "Device {ieee} re-requested offset {} (was at {})",
                    request.file_offset,
                    s.last_offset
                );
            }
            s.status = Some(OtaStatus::Downloading);
            s.last_offset = request.file_offset;
        });

        ImageBlockResponse::Success {
            manufacturer_code: image.header.manufacturer_code,
            image_type: image.header.image_type,
            file_version: image.header.file_version,
            file_offset: request.file_offset,
            image_data: block,
        }
    }

    /// Device announced the outcome of the download. A successful end gets
    /// an "apply immediately" response; protocol failures leave the device
    /// at its previous firmware and the next query starts over.
    pub fn handle_upgrade_end(
        &self,
        ieee: Eui64,
        request: &UpgradeEndRequest,
    ) -> Option<UpgradeEndResponse> {
        if request.status != Status::Success {
            tracing::warn!("OTA upgrade on {ieee} ended with {:?}", request.status);
            self.set_state(ieee, |s| {
                s.status = Some(OtaStatus::Failed);
                s.image = None;
            });
            return None;
        }

        self.set_state(ieee, |s| s.status = Some(OtaStatus::WaitingToApply));

        Some(UpgradeEndResponse {
            manufacturer_code: request.manufacturer_code,
            image_type: request.image_type,
            file_version: request.file_version,
            current_time: 0,
            upgrade_time: 0,
        })
    }

    /// The upgrade-end response made it out; the device reboots into the
    /// new firmware
    pub fn note_applied(&self, ieee: Eui64) {
        self.set_state(ieee, |s| {
            s.status = Some(OtaStatus::Applied);
            s.image = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::providers::ProviderRank;
    use super::*;
    use async_trait::async_trait;
    use zigbee_wire::ota::{FieldControl, OtaImage, OtaImageHeader, SubElement};

    fn image(version: u32, firmware_len: usize) -> Arc<CachedImage> {
        let element_size = 6 + firmware_len as u32;
        let img = OtaImage {
            header: OtaImageHeader {
                header_version: 0x0100,
                header_length: 56,
                field_control: FieldControl::empty(),
                manufacturer_code: 4476,
                image_type: 0x2101,
                file_version: version,
                stack_version: 2,
                header_string: OtaImageHeader::header_string_from("test"),
                image_size: 56 + element_size,
                security_credential_version: None,
                upgrade_file_destination: None,
                minimum_hardware_version: None,
                maximum_hardware_version: None,
            },
            subelements: vec![SubElement {
                tag: zigbee_wire::ota::ElementTag::UpgradeImage,
                data: vec![0x5A; firmware_len],
            }],
        };
        Arc::new(CachedImage::from_bytes(&img.to_wire().unwrap()).unwrap())
    }

    struct FixedProvider {
        rank: ProviderRank,
        image: Arc<CachedImage>,
    }

    #[async_trait]
    impl OtaProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn rank(&self) -> ProviderRank {
            self.rank
        }

        async fn refresh(&self) -> Result<(), crate::error::CoreError> {
            Ok(())
        }

        async fn get_image(
            &self,
            manufacturer: u16,
            image_type: u16,
            _hw_version: Option<u16>,
        ) -> Option<Arc<CachedImage>> {
            (self.image.header.manufacturer_code == manufacturer
                && self.image.header.image_type == image_type)
                .then(|| self.image.clone())
        }
    }

    fn ieee() -> Eui64 {
        "ec:1b:bd:ff:fe:54:4f:40".parse().unwrap()
    }

    #[tokio::test]
    async fn test_query_selects_newer_image() {
        let engine = OtaEngine::with_providers(vec![Box::new(FixedProvider {
            rank: ProviderRank::FirstParty,
            image: image(0x0100_0020, 100),
        })]);

        let query = QueryNextImage {
            field_control: 0,
            manufacturer_code: 4476,
            image_type: 0x2101,
            current_file_version: 0x0100_0001,
            hardware_version: None,
        };
        let response = engine.handle_query_next_image(ieee(), &query).await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.file_version, Some(0x0100_0020));

        // Same version again: nothing to offer
        let stale = QueryNextImage {
            current_file_version: 0x0100_0020,
            ..query
        };
        let response = engine.handle_query_next_image(ieee(), &stale).await;
        assert_eq!(response.status, Status::NoImageAvailable);
        assert_eq!(engine.device_status(ieee()), OtaStatus::Idle);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_local_provider() {
        let local = image(0x0100_0020, 10);
        let remote = image(0x0100_0020, 20);
        let engine = OtaEngine::with_providers(vec![
            Box::new(FixedProvider {
                rank: ProviderRank::Aggregate,
                image: remote,
            }),
            Box::new(FixedProvider {
                rank: ProviderRank::LocalDirectory,
                image: local.clone(),
            }),
        ]);

        let selected = engine
            .select_image(4476, 0x2101, 0x0100_0001, None)
            .await
            .unwrap();
        assert_eq!(selected.total_size(), local.total_size());
    }

    #[tokio::test]
    async fn test_block_transfer_and_upgrade_end() {
        let img = image(0x0100_0020, 150);
        let total = img.total_size();
        let engine = OtaEngine::with_providers(vec![Box::new(FixedProvider {
            rank: ProviderRank::FirstParty,
            image: img,
        })]);

        let query = QueryNextImage {
            field_control: 0,
            manufacturer_code: 4476,
            image_type: 0x2101,
            current_file_version: 0x0100_0001,
            hardware_version: None,
        };
        engine.handle_query_next_image(ieee(), &query).await;

        let mut offset = 0u32;
        let mut received = Vec::new();
        while offset < total {
            let response = engine.handle_image_block(
                ieee(),
                &ImageBlockRequest {
                    field_control: 0,
                    manufacturer_code: 4476,
                    image_type: 0x2101,
                    file_version: 0x0100_0020,
                    file_offset: offset,
                    maximum_data_size: 63,
                    request_node_addr: None,
                    minimum_block_period: None,
                },
            );
            let ImageBlockResponse::Success {
                file_offset,
                image_data,
                ..
            } = response
            else {
                panic!("expected a data block at offset {offset}");
            };
            assert_eq!(file_offset, offset);
            assert!(image_data.len() <= 63);
            assert!(!image_data.is_empty());
            offset += image_data.len() as u32;
            received.extend_from_slice(&image_data);
        }

        assert_eq!(received.len() as u32, total);
        assert_eq!(engine.device_status(ieee()), OtaStatus::Downloading);

        let end = engine
            .handle_upgrade_end(
                ieee(),
                &UpgradeEndRequest {
                    status: Status::Success,
                    manufacturer_code: 4476,
                    image_type: 0x2101,
                    file_version: 0x0100_0020,
                },
            )
            .expect("upgrade end response");
        assert_eq!(end.current_time, 0);
        assert_eq!(end.upgrade_time, 0);
        assert_eq!(engine.device_status(ieee()), OtaStatus::WaitingToApply);

        engine.note_applied(ieee());
        assert_eq!(engine.device_status(ieee()), OtaStatus::Applied);
    }

    #[tokio::test]
    async fn test_block_without_session_aborts() {
        let engine = OtaEngine::with_providers(vec![]);
        let response = engine.handle_image_block(
            ieee(),
            &ImageBlockRequest {
                field_control: 0,
                manufacturer_code: 4476,
                image_type: 0x2101,
                file_version: 1,
                file_offset: 0,
                maximum_data_size: 64,
                request_node_addr: None,
                minimum_block_period: None,
            },
        );
        assert_eq!(response, ImageBlockResponse::Abort);
        assert_eq!(engine.device_status(ieee()), OtaStatus::Failed);
    }
}
