#![forbid(unsafe_code)]

// Configuration for the mediasoup worker, router, and send transports

use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::str::FromStr;
use tracing::info;

/// Main media engine configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub transport_config: TransportConfig,
}

impl MediaConfig {
    /// Builds the configuration from defaults overridden by environment variables.
    ///
    /// Recognized variables: `LISTEN_IP`, `ANNOUNCE_IP`, `RTC_MIN_PORT`, `RTC_MAX_PORT`.
    ///
    /// # Errors
    /// Returns `MediaError::ConfigurationError` if a variable is set but invalid
    pub fn from_env() -> MediaResult<Self> {
        let mut config = Self::default();

        config.transport_config.listen_ip =
            env_or("LISTEN_IP", config.transport_config.listen_ip)?;

        if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
            let addr: IpAddr = ip
                .parse()
                .map_err(|_| MediaError::ConfigurationError(format!("Invalid ANNOUNCE_IP: {ip}")))?;
            info!("Using ANNOUNCE_IP={}", addr);
            config.transport_config = config.transport_config.with_public_ip(addr);
        }

        config.worker_config.rtc_min_port = env_or("RTC_MIN_PORT", config.worker_config.rtc_min_port)?;
        config.worker_config.rtc_max_port = env_or("RTC_MAX_PORT", config.worker_config.rtc_max_port)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// Returns `MediaError::ConfigurationError` describing the first violated constraint
    pub fn validate(&self) -> MediaResult<()> {
        if self.worker_config.rtc_min_port > self.worker_config.rtc_max_port {
            return Err(MediaError::ConfigurationError(format!(
                "RTC port range is empty: {}..={}",
                self.worker_config.rtc_min_port, self.worker_config.rtc_max_port
            )));
        }
        if !self.transport_config.enable_udp && !self.transport_config.enable_tcp {
            return Err(MediaError::ConfigurationError(
                "At least one of UDP or TCP must be enabled".to_string(),
            ));
        }
        if self.router_config.media_codecs.is_empty() {
            return Err(MediaError::ConfigurationError("No media codecs configured".to_string()));
        }
        Ok(())
    }
}

/// Reads `name` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> MediaResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MediaError::ConfigurationError(format!("Invalid {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus stereo for audio, VP8 for video.
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("x-google-start-bitrate", 1000_u32.into()),
                ]),
                rtcp_feedback: vec![],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// Network configuration applied to every send transport the engine allocates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl TransportConfig {
    /// Sets the public IP address advertised in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    /// Converts to WebRtcTransportOptions, listing the preferred protocol first
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let mut protocols = Vec::with_capacity(2);
        if self.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if self.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if self.prefer_tcp && !self.prefer_udp {
            protocols.reverse();
        }

        let mut protocols = protocols.into_iter();
        let first = protocols.next().unwrap_or(Protocol::Udp);
        let listen_infos = protocols.fold(
            WebRtcTransportListenInfos::new(self.listen_info(first)),
            |infos, protocol| infos.insert(self.listen_info(protocol)),
        );

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = self.enable_udp;
        options.enable_tcp = self.enable_tcp;
        options.prefer_udp = self.prefer_udp;
        options.prefer_tcp = self.prefer_tcp;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}
