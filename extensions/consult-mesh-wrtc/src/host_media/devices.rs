use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use consult::{
    error::{Error, MediaAccessError},
    mesh::TrackKind,
};
use parking_lot::RwLock;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
};

use super::track::LocalTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: TrackKind,
}

/// Opens capture devices. Acquisition is one of the few operations allowed to suspend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self, kind: TrackKind) -> Result<Vec<DeviceInfo>, Error>;
    /// `device_id` of None selects the default device for `kind`.
    /// a denied permission or a missing device is `Error::MediaUnavailable`
    async fn acquire(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<Arc<LocalTrack>, Error>;
}

pub fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: vec![],
        },
    }
}

#[derive(Default)]
struct HostDevicesInner {
    devices: Vec<DeviceInfo>,
    denied: HashSet<TrackKind>,
    acquisitions: usize,
}

/// Devices registered by the embedding application.
///
/// The application owns the actual capture pipeline: it registers what it can capture, reflects
/// the OS permission state through `set_permission`, and feeds RTP into the tracks this type
/// hands out. The first registered device of a kind is its default.
#[derive(Default)]
pub struct HostDevices {
    inner: RwLock<HostDevicesInner>,
}

impl HostDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, kind: TrackKind, device_id: &str, label: &str) {
        let mut inner = self.inner.write();
        if inner.devices.iter().any(|d| d.device_id == device_id) {
            tracing::warn!(device_id, "device already registered");
            return;
        }
        inner.devices.push(DeviceInfo {
            device_id: device_id.into(),
            label: label.into(),
            kind,
        });
    }

    pub fn remove_device(&self, device_id: &str) {
        self.inner.write().devices.retain(|d| d.device_id != device_id);
    }

    pub fn set_permission(&self, kind: TrackKind, granted: bool) {
        let mut inner = self.inner.write();
        if granted {
            inner.denied.remove(&kind);
        } else {
            inner.denied.insert(kind);
        }
    }

    /// number of captures opened so far
    pub fn acquisitions(&self) -> usize {
        self.inner.read().acquisitions
    }
}

#[async_trait]
impl MediaDevices for HostDevices {
    async fn enumerate(&self, kind: TrackKind) -> Result<Vec<DeviceInfo>, Error> {
        Ok(self
            .inner
            .read()
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }

    async fn acquire(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<Arc<LocalTrack>, Error> {
        let mut inner = self.inner.write();
        if inner.denied.contains(&kind) {
            return Err(Error::MediaUnavailable {
                kind,
                reason: MediaAccessError::Denied,
            });
        }
        let device = inner
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .find(|d| device_id.map(|id| id == d.device_id).unwrap_or(true))
            .cloned()
            .ok_or(Error::MediaUnavailable {
                kind,
                reason: MediaAccessError::NotFound,
            })?;
        inner.acquisitions += 1;
        tracing::debug!(device_id = %device.device_id, %kind, "capture acquired");
        Ok(Arc::new(LocalTrack::new(
            kind,
            Some(device.device_id),
            codec_for(kind),
        )))
    }
}
