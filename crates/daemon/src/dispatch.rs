// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! Per-frame protocol routing.
//!
//! A [`Route`] is chosen once per session from the configured protocol and
//! then applied to every captured frame. Routes never block: an SSH route
//! whose tunnel is down reports [`DispatchError::TunnelInactive`] instead of
//! waiting for it.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

use maccaronia_common::{
    Config, CustomUdpConfig, DnsConfig, PayloadConfig, Protocol, SniConfig, V2RayConfig,
};

use crate::ssh::TunnelLiveness;

pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("SSH tunnel expected active but is not running")]
    TunnelInactive,

    #[error("{codec} codec failed: {source}")]
    Codec {
        codec: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("Route panicked while handling a frame")]
    Panicked,
}

/// Settings that travel with every frame
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub dns: DnsConfig,
    pub sni: SniConfig,
    pub payload: PayloadConfig,
}

impl RouteContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dns: config.dns.clone(),
            sni: config.sni.clone(),
            payload: config.payload.clone(),
        }
    }
}

/// Extension point for protocol-specific frame transforms
pub trait FrameCodec: Send + Sync {
    fn process<'a>(
        &self,
        frame: &'a [u8],
        context: &RouteContext,
    ) -> Result<Cow<'a, [u8]>, CodecError>;
}

/// Codecs available to the dispatcher; absent ones mean pass-through
#[derive(Clone, Default)]
pub struct CodecRegistry {
    pub custom_udp: Option<Arc<dyn FrameCodec>>,
    pub v2ray: Option<Arc<dyn FrameCodec>>,
}

pub enum Route {
    /// Traffic already flows through the supervisor's listener
    Ssh(Option<TunnelLiveness>),
    CustomUdp {
        settings: CustomUdpConfig,
        codec: Option<Arc<dyn FrameCodec>>,
    },
    V2Ray {
        settings: V2RayConfig,
        codec: Option<Arc<dyn FrameCodec>>,
    },
    Passthrough,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Ssh(liveness) => f
                .debug_tuple("Ssh")
                .field(&liveness.as_ref().map(|p| p.is_active()))
                .finish(),
            Route::CustomUdp { codec, .. } => f
                .debug_struct("CustomUdp")
                .field("codec", &codec.is_some())
                .finish(),
            Route::V2Ray { codec, .. } => f
                .debug_struct("V2Ray")
                .field("codec", &codec.is_some())
                .finish(),
            Route::Passthrough => f.write_str("Passthrough"),
        }
    }
}

impl Route {
    pub fn for_protocol(
        config: &Config,
        liveness: Option<TunnelLiveness>,
        codecs: &CodecRegistry,
    ) -> Self {
        match config.protocol {
            Protocol::Ssh => Route::Ssh(liveness),
            Protocol::CustomUdp => Route::CustomUdp {
                settings: config.custom_udp.clone(),
                codec: codecs.custom_udp.clone(),
            },
            Protocol::V2Ray => Route::V2Ray {
                settings: config.v2ray.clone(),
                codec: codecs.v2ray.clone(),
            },
            Protocol::Socks5 | Protocol::Http => Route::Passthrough,
        }
    }

    pub fn handle<'a>(
        &self,
        frame: &'a [u8],
        context: &RouteContext,
    ) -> Result<Cow<'a, [u8]>, DispatchError> {
        match self {
            Route::Ssh(Some(liveness)) if liveness.is_active() => Ok(Cow::Borrowed(frame)),
            Route::Ssh(_) => Err(DispatchError::TunnelInactive),
            Route::CustomUdp { codec, .. } => apply(codec.as_deref(), "custom-udp", frame, context),
            Route::V2Ray { codec, .. } => apply(codec.as_deref(), "v2ray", frame, context),
            Route::Passthrough => Ok(Cow::Borrowed(frame)),
        }
    }
}

fn apply<'a>(
    codec: Option<&dyn FrameCodec>,
    name: &'static str,
    frame: &'a [u8],
    context: &RouteContext,
) -> Result<Cow<'a, [u8]>, DispatchError> {
    match codec {
        Some(codec) => codec
            .process(frame, context)
            .map_err(|source| DispatchError::Codec { codec: name, source }),
        None => Ok(Cow::Borrowed(frame)),
    }
}

/// Route plus context for one session
#[derive(Debug)]
pub struct Dispatcher {
    route: Route,
    context: RouteContext,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        liveness: Option<TunnelLiveness>,
        codecs: &CodecRegistry,
    ) -> Self {
        Self {
            route: Route::for_protocol(config, liveness, codecs),
            context: RouteContext::from_config(config),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn dispatch<'a>(&self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>, DispatchError> {
        self.route.handle(frame, &self.context)
    }
}
