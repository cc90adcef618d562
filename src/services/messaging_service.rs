// src/services/messaging_service.rs
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::{
    errors::{AppError, AppResult},
    models::{Booking, Driver},
};

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub fcm_server_key: String,
    pub fcm_url: String,
}

impl FcmConfig {
    pub fn with_server_key(server_key: impl Into<String>) -> Self {
        Self {
            fcm_server_key: server_key.into(),
            fcm_url: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPriority {
    Normal,
    High, // Will wake sleeping devices
}

impl Default for NotificationPriority {
    fn default() -> Self {
        Self::High
    }
}

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failure_count: usize,
}

/// External push provider. Must accept an empty batch.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send_batch(&self, messages: Vec<PushMessage>) -> AppResult<BatchOutcome>;
}

pub struct FcmPushProvider {
    config: FcmConfig,
    client: reqwest::Client,
}

impl FcmPushProvider {
    pub fn new(config: FcmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn send_one(&self, message: PushMessage) -> AppResult<()> {
        if message.device_token.is_empty() {
            return Err(AppError::PushDelivery("Empty device token".to_string()));
        }

        let mut fcm_message = json!({
            "to": message.device_token,
            "notification": {
                "title": message.title,
                "body": message.body,
                "sound": "default"
            },
            "priority": match message.priority {
                NotificationPriority::High => "high",
                NotificationPriority::Normal => "normal",
            }
        });

        if let Some(data) = message.data {
            fcm_message["data"] = data;
        }

        let response = self
            .client
            .post(&self.config.fcm_url)
            .header("Authorization", format!("key={}", self.config.fcm_server_key))
            .json(&fcm_message)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::PushDelivery(error_text));
        }

        Ok(())
    }
}

#[async_trait]
impl PushProvider for FcmPushProvider {
    async fn send_batch(&self, messages: Vec<PushMessage>) -> AppResult<BatchOutcome> {
        if messages.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let results = join_all(messages.into_iter().map(|m| self.send_one(m))).await;

        let mut outcome = BatchOutcome::default();
        for result in results {
            match result {
                Ok(()) => outcome.success_count += 1,
                Err(e) => {
                    tracing::warn!("FCM delivery failed: {}", e);
                    outcome.failure_count += 1;
                }
            }
        }

        tracing::debug!(
            "FCM batch sent: {} delivered, {} failed",
            outcome.success_count,
            outcome.failure_count
        );
        Ok(outcome)
    }
}

// Mock provider for local development
#[derive(Debug)]
pub struct MockPushProvider;

#[async_trait]
impl PushProvider for MockPushProvider {
    async fn send_batch(&self, messages: Vec<PushMessage>) -> AppResult<BatchOutcome> {
        for message in &messages {
            tracing::info!(
                "[MOCK] Would push to {}: {} - {}",
                message.device_token,
                message.title,
                message.body
            );
        }
        Ok(BatchOutcome {
            success_count: messages.len(),
            failure_count: 0,
        })
    }
}

/// What a driver sees in a trip offer.
#[derive(Debug, Clone, Serialize)]
pub struct TripSummary {
    pub booking_id: String,
    pub reference: String,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub fare: i64,
    pub distance_km: f64,
}

impl From<&Booking> for TripSummary {
    fn from(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id.clone(),
            reference: booking.reference.clone(),
            pickup_address: booking.source.address.clone(),
            dropoff_address: booking.destination.address.clone(),
            fare: booking.total_price,
            distance_km: booking.distance_km,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub drivers_notified: usize,
    pub total_drivers: usize,
}

/// Fans trip offers out to matched drivers. Delivery is best effort: a
/// failing or missing provider never fails the caller.
pub struct NotificationDispatcher {
    provider: Option<Arc<dyn PushProvider>>,
}

impl NotificationDispatcher {
    pub fn new(provider: Option<Arc<dyn PushProvider>>) -> Self {
        Self { provider }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn trip_request_message(summary: &TripSummary, device_token: &str) -> PushMessage {
        PushMessage {
            device_token: device_token.to_string(),
            title: "New Trip Request".to_string(),
            body: format!(
                "{} to {} - ₹{} ({:.1} km)",
                summary.pickup_address, summary.dropoff_address, summary.fare, summary.distance_km
            ),
            data: Some(json!({
                "type": "trip_request",
                "booking_id": summary.booking_id,
                "reference": summary.reference,
                "pickup_address": summary.pickup_address,
                "dropoff_address": summary.dropoff_address,
                "fare": summary.fare.to_string(),
                "distance_km": format!("{:.1}", summary.distance_km),
            })),
            priority: NotificationPriority::High,
        }
    }

    pub async fn notify_drivers(&self, summary: &TripSummary, drivers: &[Driver]) -> DispatchReport {
        let Some(provider) = &self.provider else {
            tracing::debug!("Push provider not configured, skipping offer for {}", summary.booking_id);
            return DispatchReport::default();
        };

        let messages: Vec<PushMessage> = drivers
            .iter()
            .filter_map(|d| d.push_token.as_deref())
            .filter(|token| !token.trim().is_empty())
            .map(|token| Self::trip_request_message(summary, token))
            .collect();

        let total_drivers = drivers.len();
        match provider.send_batch(messages).await {
            Ok(outcome) => {
                tracing::info!(
                    "Trip {} offered to {}/{} drivers",
                    summary.booking_id,
                    outcome.success_count,
                    total_drivers
                );
                DispatchReport {
                    drivers_notified: outcome.success_count,
                    total_drivers,
                }
            }
            Err(e) => {
                tracing::error!("Push batch for trip {} failed: {}", summary.booking_id, e);
                DispatchReport {
                    drivers_notified: 0,
                    total_drivers,
                }
            }
        }
    }
}
