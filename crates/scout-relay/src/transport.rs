use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use scout_buffer::LoadedTask;
use scout_proto::wire;
use std::time::Duration;
use thiserror::Error;

use crate::RelayConfig;

#[derive(Debug, Error)]
pub enum TransmissionFailure {
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("could not build request: {0}")]
    Payload(String),
}

/// Delivers one buffered task. `Ok` means the receiver acknowledged it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, task: &LoadedTask) -> Result<(), TransmissionFailure>;
}

/// Multipart POST to the ingest endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    skip_tunnel_interstitial: bool,
}

impl HttpTransport {
    pub fn new(cfg: &RelayConfig) -> Result<Self> {
        let timeout = Duration::try_from_secs_f64(cfg.timeout_s)
            .ok()
            .filter(|t| !t.is_zero())
            .with_context(|| format!("relay.timeout_s {} is not a usable duration", cfg.timeout_s))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            skip_tunnel_interstitial: cfg.skip_tunnel_interstitial,
        })
    }

    fn form(task: &LoadedTask) -> Result<Form, TransmissionFailure> {
        let jpeg = |bytes: &Bytes, name: &'static str| {
            Part::bytes(bytes.to_vec())
                .file_name(name)
                .mime_str("image/jpeg")
                .map_err(|e| TransmissionFailure::Payload(e.to_string()))
        };

        let mut form = Form::new()
            .part(wire::PART_LEFT, jpeg(&task.left, "left.jpg")?)
            .part(wire::PART_RIGHT, jpeg(&task.right, "right.jpg")?);
        if let Some(mask) = &task.mask {
            form = form.part(wire::PART_MASK, jpeg(mask, "mask.jpg")?);
        }
        Ok(form
            .text(wire::FIELD_LATITUDE, task.gps.lat.to_string())
            .text(wire::FIELD_LONGITUDE, task.gps.lon.to_string())
            .text(wire::FIELD_FRAME_ID, task.gps.frame.clone()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, task: &LoadedTask) -> Result<(), TransmissionFailure> {
        let mut req = self.client.post(&self.endpoint).multipart(Self::form(task)?);
        if self.skip_tunnel_interstitial {
            req = req.header(wire::TUNNEL_SKIP_HEADER, "true");
        }

        let resp = req.send().await.map_err(|e| TransmissionFailure::Network(format!("{:#}", e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
        Err(TransmissionFailure::Status { status: status.as_u16(), body })
    }
}
